//! `reqforge serve`.

use std::sync::Arc;

use anyhow::{Result, bail};
use reqforge::config::Config;

pub async fn cmd_serve(mut config: Config, port: Option<u16>) -> Result<()> {
    if let Some(port) = port {
        config.server.port = port;
    }
    let problems = config.validate();
    if !problems.is_empty() {
        bail!("Invalid configuration:\n  {}", problems.join("\n  "));
    }

    println!(
        "reqforge serving on http://{}:{} ({} workers)",
        config.server.host, config.server.port, config.codegen.max_workers
    );
    reqforge::server::start_server(Arc::new(config)).await
}
