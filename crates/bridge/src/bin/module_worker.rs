use std::io::{self, BufReader};
use std::sync::Arc;

use bridge::logging::{DEFAULT_FILTER, init_tracing};
use bridge::transport::{JsonLineReader, JsonLineWriter};
use bridge::worker::ModuleWorker;
use guest::toolbox::toolbox;

fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    init_tracing(DEFAULT_FILTER);

    let outbound = Arc::new(JsonLineWriter::new(io::stdout()));
    let mut inbound = JsonLineReader::new(BufReader::new(io::stdin()));
    tracing::debug!(pid = std::process::id(), "module worker starting");
    match ModuleWorker::new(toolbox(), outbound).serve(&mut inbound) {
        Ok(()) => Ok(()),
        Err(bridge::TransportError::Closed) => {
            tracing::debug!("controller went away");
            Ok(())
        }
        Err(err) => Err(err.into()),
    }
}
