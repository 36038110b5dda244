pub mod backup;
pub mod backuph;

use std::sync::Arc;

use crate::core::{App, Registry};

pub fn register_all(reg: &mut Registry, app: Arc<App>) {
    backuph::register(reg, app);
}
