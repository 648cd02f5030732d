use std::sync::Arc;

use log::warn;
use prometheus::Registry;

use common::error::Result;

use crate::discover::discover::{self, ENV_COLLECTOR_ID};

/// Process-wide settings handed to every component at construction time.
#[derive(Clone)]
pub struct Options {
    /// Coordinator address and this agent's `collector_id`.
    pub discovery: discover::Arguments,
    pub registerer: Arc<Registry>,
}

impl Options {
    pub fn new(discovery: discover::Arguments, registerer: Arc<Registry>) -> Options {
        Options {
            discovery,
            registerer,
        }
    }

    pub fn from_env(registerer: Arc<Registry>) -> Result<Options> {
        let discovery = discover::Arguments::from_env()?;
        if discovery.collector_id.is_empty() {
            warn!("{} is not set, discovery requests carry an empty collector_id", ENV_COLLECTOR_ID);
        }
        Ok(Options::new(discovery, registerer))
    }
}

impl Default for Options {
    fn default() -> Self {
        Options::new(discover::Arguments::default(), Arc::new(Registry::new()))
    }
}
