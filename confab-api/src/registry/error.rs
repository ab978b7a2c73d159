use confab_sfu::{ClientId, RoomId, SfuError};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    #[error("Client {0} is not connected")]
    UnknownClient(ClientId),

    #[error("Client {0} is not in a room")]
    NotInRoom(ClientId),

    #[error("Client {0} is not in the sender's room")]
    NotInSameRoom(ClientId),

    #[error("Room {0} is full")]
    RoomFull(RoomId),

    #[error(transparent)]
    Media(#[from] SfuError),
}

pub type Result<T> = std::result::Result<T, RegistryError>;
