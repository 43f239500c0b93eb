//! Room and roster records as stored in the signaling document store.

mod state;

pub use state::{
    ActiveView, ParticipantRecord, PermissionUpdate, Role, RoomRecord, RoomSettings, TopologyMode,
};
