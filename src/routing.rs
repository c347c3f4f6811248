use crate::config::Config;

/// Which side of the catalog a request is answered from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
    Cache,
    Store,
}

/// Per-request routing hint, e.g. from the `use-database` header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RequestDirective {
    pub use_database: bool,
}

impl RequestDirective {
    pub fn use_database() -> Self {
        Self { use_database: true }
    }
}

/// Decides between the snapshot cache and the record store.
///
/// Without selective routing the answer depends only on whether a store is
/// configured. With it, the cache is the default and a request has to ask for
/// the store explicitly.
#[derive(Debug, Clone, Copy)]
pub struct SourceRouter {
    selective_routing: bool,
    store_configured: bool,
}

impl SourceRouter {
    pub fn new(selective_routing: bool, store_configured: bool) -> Self {
        Self { selective_routing, store_configured }
    }

    pub fn from_config(config: &Config) -> Self {
        Self::new(config.enable_selective_routing, config.store_configured())
    }

    pub fn store_configured(&self) -> bool {
        self.store_configured
    }

    pub fn resolve(&self, directive: RequestDirective) -> Source {
        if !self.store_configured {
            return Source::Cache;
        }
        if !self.selective_routing || directive.use_database {
            Source::Store
        } else {
            Source::Cache
        }
    }
}
