//! Basic usage example for the radionet wire format.

use radionet_wire::{
    parse_from_text, render_as_text, Command, InternalType, Message, Payload, BROADCAST_ADDRESS,
    GATEWAY_ADDRESS,
};

fn main() -> Result<(), Box<dyn std::error::Error>> {
    println!("=== Radionet Wire Format Example ===\n");

    // 1. A temperature reading from node 12, child sensor 1
    println!("1. Encoding a SET message...");
    let reading = Message::new(Command::Set, 0, 12, GATEWAY_ADDRESS)
        .with_child(1)
        .with_payload(Payload::float(21.75, 2))
        .with_request_ack(true);

    let frame = reading.encode()?;
    println!("   Encoded frame size: {} bytes", frame.len());
    println!("   Bytes: {:02X?}", frame.as_slice());

    // 2. Decode it again
    println!("\n2. Decoding the frame...");
    let decoded = Message::decode(&frame)?;
    println!("   Sender: {}", decoded.sender);
    println!("   Child: {}", decoded.child_id);
    println!("   Ack requested: {}", decoded.request_ack());
    println!("   Matches original: {}", decoded == reading);

    // 3. What the gateway writes to a controller
    println!("\n3. Rendering as a bridge line...");
    print!("   {}", render_as_text(&decoded));

    // 4. What a controller writes back
    println!("\n4. Parsing a controller line...");
    let command = parse_from_text("12;1;1;2;0;on\n")?;
    println!(
        "   To node {} child {}: {:?}",
        command.destination,
        command.child_id,
        command.payload.as_str()
    );

    // 5. Parent discovery broadcast
    println!("\n5. Building a FIND_PARENT broadcast...");
    let find = Message::internal(InternalType::FindParent, 255, BROADCAST_ADDRESS);
    println!("   Frame: {:02X?}", find.encode()?.as_slice());

    println!("\n=== Example completed successfully! ===");
    Ok(())
}
