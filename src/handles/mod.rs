pub mod automation;
pub mod data;
pub mod filesystem;
pub mod network;
pub mod security;

use std::sync::Arc;

use crate::core::{App, Registry};

pub fn register_all(reg: &mut Registry, app: Arc<App>) {
    automation::register_all(reg, app.clone());
    data::register_data(reg, app.clone());
    network::register_network(reg, app);
}
