use anyhow::Result;
use huntbuddy_core::{AppConfig, StateObserver};
use huntbuddy_observe::Observer;
use huntbuddy_store::SessionStore;
use std::path::PathBuf;
use std::sync::Arc;

pub(crate) struct CliContext {
    pub cwd: PathBuf,
    pub session: String,
    pub json: bool,
    pub verbose: bool,
}

/// Loaded configuration plus a store wired to the workspace observer.
pub(crate) struct Runtime {
    pub cfg: AppConfig,
    pub store: SessionStore,
    pub observer: Arc<Observer>,
}

impl CliContext {
    pub(crate) fn load_config(&self) -> Result<AppConfig> {
        AppConfig::load(&self.cwd)
    }

    pub(crate) fn runtime(&self) -> Result<Runtime> {
        let cfg = self.load_config()?;
        let mut observer = Observer::new(&self.cwd, &cfg.telemetry)?;
        observer.set_verbose(self.verbose);
        let observer = Arc::new(observer);
        let store = SessionStore::from_config(
            &self.cwd,
            &cfg.store,
            Some(observer.clone() as Arc<dyn StateObserver>),
        );
        observer.verbose_log(&format!(
            "session table {}",
            cfg.store.state_path(&self.cwd).display()
        ));
        Ok(Runtime {
            cfg,
            store,
            observer,
        })
    }
}
