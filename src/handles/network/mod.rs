pub mod neth;
pub mod notify;
pub mod sshh;

use std::sync::Arc;

use crate::core::{App, Registry};

pub fn register_network(reg: &mut Registry, app: Arc<App>) {
    neth::register(reg, app);
}
