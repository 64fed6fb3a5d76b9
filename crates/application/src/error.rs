use domain::{CodecError, DomainError, RepositoryError};
use thiserror::Error;

use crate::delivery::DeliveryError;
use crate::hub::HubError;
use crate::presence_store::PresenceStoreError;

#[derive(Debug, Error)]
pub enum ApplicationError {
    #[error("domain error: {0}")]
    Domain(#[from] DomainError),
    #[error("codec error: {0}")]
    Codec(#[from] CodecError),
    #[error("repository error: {0}")]
    Repository(#[from] RepositoryError),
    #[error("presence store error: {0}")]
    PresenceStore(#[from] PresenceStoreError),
    #[error("hub error: {0}")]
    Hub(#[from] HubError),
    #[error("delivery error: {0}")]
    Delivery(#[from] DeliveryError),
}
