#![deny(warnings, rust_2018_idioms)]
#![forbid(unsafe_code)]

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    cloudflared_tunnel_controller_runtime::Args::parse_and_run().await
}
