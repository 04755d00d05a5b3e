#[tokio::main]
async fn main() {
    servicedesk_offline_lib::run().await
}
