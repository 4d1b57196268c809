//! NoChat Keycore - Main entry point
//!
//! Runs the key engine for one device. All the heavy lifting is done in lib.rs.

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    nochat_keycore::run().await
}
