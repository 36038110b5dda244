pub mod cacheh;

use std::sync::Arc;

use crate::core::{App, Registry};

pub fn register_data(reg: &mut Registry, app: Arc<App>) {
    cacheh::register(reg, app);
}
