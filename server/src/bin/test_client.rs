use futures_util::{SinkExt, StreamExt};
use shared::{ClientMessage, PositionReport};
use std::time::Duration;
use tokio::time::sleep;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Manual exercise client for a locally running coordinator.
///
/// Usage: test_client <token> [race_id]
/// Connects with the given bearer token, optionally joins a race, then
/// streams a few position updates and prints everything the server sends.
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let mut args = std::env::args().skip(1);
    let token = args.next().unwrap_or_else(|| "test-driver".to_string());
    let race_id = args.next();

    let url = format!("ws://127.0.0.1:8080/live?token={}", token);
    println!("Connecting to {}", url);
    let (ws_stream, _) = connect_async(url).await?;
    let (mut write, mut read) = ws_stream.split();

    // Reader task prints every server event as it arrives
    let reader = tokio::spawn(async move {
        while let Some(frame) = read.next().await {
            match frame {
                Ok(Message::Text(text)) => println!("<- {}", text),
                Ok(Message::Close(_)) => {
                    println!("Server closed the connection");
                    break;
                }
                Ok(_) => {}
                Err(e) => {
                    println!("Read error: {}", e);
                    break;
                }
            }
        }
    });

    let ping = serde_json::to_string(&ClientMessage::Ping { data: None })?;
    println!("-> {}", ping);
    write.send(Message::Text(ping)).await?;

    if let Some(race_id) = race_id {
        let join = serde_json::to_string(&ClientMessage::JoinRace {
            race_id: race_id.clone(),
            vehicle_id: "test-vehicle".to_string(),
        })?;
        println!("-> {}", join);
        write.send(Message::Text(join)).await?;

        // Stream positions for a while; once the race goes ACTIVE these
        // start registering checkpoints
        for i in 0..40 {
            let update = serde_json::to_string(&ClientMessage::PositionUpdate {
                race_id: race_id.clone(),
                position: PositionReport {
                    lat: 45.0703 + 0.0002 * i as f64,
                    lon: 7.6869 + 0.0001 * i as f64,
                    speed: 95.0,
                    heading: 35.0,
                },
            })?;
            write.send(Message::Text(update)).await?;
            sleep(Duration::from_millis(500)).await;
        }

        let leave = serde_json::to_string(&ClientMessage::LeaveRace { race_id })?;
        println!("-> {}", leave);
        write.send(Message::Text(leave)).await?;
    } else {
        println!("No race id given; staying connected for 30s of pings");
        for _ in 0..30 {
            let ping = serde_json::to_string(&ClientMessage::Ping { data: None })?;
            write.send(Message::Text(ping)).await?;
            sleep(Duration::from_secs(1)).await;
        }
    }

    write.send(Message::Close(None)).await?;
    let _ = reader.await;
    println!("Test client finished");

    Ok(())
}
