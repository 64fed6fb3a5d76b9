use std::sync::Arc;

use application::Realtime;

use crate::{JwtService, OriginPolicy};

#[derive(Clone)]
pub struct AppState {
    pub realtime: Arc<Realtime>,
    pub jwt_service: Arc<JwtService>,
    pub origin_policy: Arc<OriginPolicy>,
}

impl AppState {
    pub fn new(
        realtime: Arc<Realtime>,
        jwt_service: Arc<JwtService>,
        origin_policy: Arc<OriginPolicy>,
    ) -> Self {
        Self {
            realtime,
            jwt_service,
            origin_policy,
        }
    }
}
