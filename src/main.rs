use leasemq::auth::crypto::generate_api_key;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    match std::env::args().nth(1).as_deref() {
        Some("generate-key") => {
            let generated = generate_api_key()?;

            println!("key:  {}", generated.key);
            println!("LEASEMQ_API_KEY_HASH={}", generated.hash);

            Ok(())
        }
        Some(other) => Err(eyre::eyre!("Unknown command: {other}")),
        None => leasemq::run().start().await,
    }
}
