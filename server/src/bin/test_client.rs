//! Hand-testing client: logs in, reads and writes one schedule slot and
//! then prints any updates pushed by other clients.

use shared::{AssigneeName, ClientMessage, DutyKind, Frame, ServerMessage, SlotKey};
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::time::timeout;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let addr = std::env::args()
        .nth(1)
        .unwrap_or_else(|| "127.0.0.1:8080".to_string());

    let mut stream = TcpStream::connect(&addr).await?;
    println!("Connected to {}", addr);

    // Log in with the shared credential
    ClientMessage::Login {
        credential: shared::SHARED_CREDENTIAL.to_vec(),
    }
    .encode()
    .write_to(&mut stream)
    .await?;

    match read_message(&mut stream).await? {
        ServerMessage::LoginResponse { accepted } => {
            println!("Login {}", if accepted { "accepted" } else { "rejected" });
            if !accepted {
                return Ok(());
            }
        }
        other => println!("Unexpected reply to login: {:?}", other),
    }

    let key = SlotKey::new(DutyKind::StableIn, 2, 2024);

    // Query the slot before writing it
    ClientMessage::GetAssignment { key }
        .encode()
        .write_to(&mut stream)
        .await?;
    match read_message(&mut stream).await? {
        ServerMessage::AssignmentUpdate { key, name } => {
            println!("Current assignee for {}: \"{}\"", key, name)
        }
        other => println!("Unexpected reply to get: {:?}", other),
    }

    // Take the slot
    ClientMessage::SetAssignment {
        key,
        name: AssigneeName::from("Bob"),
    }
    .encode()
    .write_to(&mut stream)
    .await?;
    println!("Assigned {} to Bob", key);

    // Watch for updates broadcast by other clients for a little while
    println!("Listening for updates (10s)...");
    loop {
        match timeout(Duration::from_secs(10), Frame::read_from(&mut stream)).await {
            Ok(Ok(Some(frame))) => match ServerMessage::decode(&frame) {
                Ok(ServerMessage::AssignmentUpdate { key, name }) => {
                    println!("Update: {} is now \"{}\"", key, name)
                }
                Ok(other) => println!("Received: {:?}", other),
                Err(e) => println!("Undecodable frame: {}", e),
            },
            Ok(Ok(None)) => {
                println!("Server closed the connection");
                break;
            }
            Ok(Err(e)) => {
                println!("Read error: {}", e);
                break;
            }
            Err(_) => {
                println!("No updates, done");
                break;
            }
        }
    }

    Ok(())
}

async fn read_message(stream: &mut TcpStream) -> Result<ServerMessage, Box<dyn std::error::Error>> {
    let frame = Frame::read_from(stream)
        .await?
        .ok_or("server closed the connection")?;
    Ok(ServerMessage::decode(&frame)?)
}
