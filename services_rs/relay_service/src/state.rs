use crate::hub::Hub;
use relay_core::envelope::EnvelopeLimits;
use relay_core::presence::PresenceTracker;
use relay_core::session::SessionIssuer;
use relay_core::store::RelayStore;
use std::sync::Arc;

#[derive(Clone)]
pub struct AppState {
    pub store: Arc<dyn RelayStore>,
    pub sessions: Arc<SessionIssuer>,
    pub tracker: Arc<PresenceTracker>,
    pub hub: Arc<Hub>,
    pub env_name: String,
    pub internal_secret: Option<String>,
    pub limits: EnvelopeLimits,
}
