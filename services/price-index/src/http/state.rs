use crate::service::Components;

#[derive(Clone)]
pub struct AppState {
    pub components: Components,
}

impl AppState {
    pub fn new(components: Components) -> Self {
        Self { components }
    }
}
