//! Echo server plus one client call.
//!
//! ```text
//! cargo run --example echo                 # defaults, random port
//! cargo run --example echo -- server.toml  # [server] + [clusters.<run_mode>]
//! ```

use std::sync::Arc;

use meshwire::registry::{LocalRegistry, ServiceRegistry, PROTOCOL_VERSION};
use meshwire::{
    Bindings, Client, Interface, Options, Request, ServerBuilder, ServerConfig, ServiceDescriptor,
};
use serde::{Deserialize, Serialize};

#[derive(Deserialize, Debug)]
struct EchoInput {
    message: String,
}

#[derive(Serialize, Deserialize, Debug)]
struct EchoOutput {
    echo: String,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = match std::env::args().nth(1) {
        Some(path) => Options::from_file(path)?.server_config()?,
        None => ServerConfig {
            bind_address: "127.0.0.1:0".to_string(),
            ..ServerConfig::default()
        },
    };

    let interface = Interface::new("EchoService").method::<(EchoInput,), Result<EchoOutput, String>>("Echo");
    let bindings = Bindings::new(()).bind("Echo", |_svc, (input,): (EchoInput,)| async move {
        Ok::<_, String>(EchoOutput { echo: input.message })
    });

    let registry = Arc::new(LocalRegistry::new());
    let server = ServerBuilder::from_config(config)
        .service(ServiceDescriptor::build("/service/echo", "*", bindings, &interface))
        .registry(registry.clone())
        .shutdown_grace(std::time::Duration::ZERO)
        .monitor(|report: &meshwire::StatReport| {
            println!("stat: {} received, {} processed", report.received, report.processed);
        })
        .start()
        .await?;

    let endpoints = registry.resolve("/service/echo", PROTOCOL_VERSION, "*").await?;
    println!("published at {:?}", endpoints.iter().map(|e| &e.host_port).collect::<Vec<_>>());

    let client = Client::connect(&server.local_addr().to_string()).await?;
    let request = Request::new("/service/echo", "Echo").arg(&serde_json::json!({ "message": "hello" }))?;
    let response = client.invoke(&request).await?;
    let output: EchoOutput = response.decode_result()?;
    println!("{:?}", output);

    drop(client);
    server.shutdown().await?;
    Ok(())
}
