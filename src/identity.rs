//! Client identity generation

use uuid::Uuid;

/// Source of client identities for new inbounds
pub trait ClientIdGenerator: Send + Sync {
    fn generate(&self) -> Uuid;
}

/// Random v4 UUIDs drawn from the OS CSPRNG
#[derive(Debug, Default, Clone, Copy)]
pub struct RandomClientIds;

impl ClientIdGenerator for RandomClientIds {
    fn generate(&self) -> Uuid {
        Uuid::new_v4()
    }
}
