//! Worker restart commands

use super::Wrapper;
use crate::grammar::{Handler, Registry, Reload};

fn reload(name: &str, reload: Reload) -> Handler {
    Handler::new(name, move |_args| async move { Err(anyhow::Error::from(reload)) })
}

pub(super) fn control() -> Wrapper {
    let mut registry = Registry::new();
    registry.register("start", reload("restart", Reload::Restart));
    registry.register("safe mode", reload("restart_safe", Reload::RestartSafe));
    Wrapper::always("control", registry)
}
