pub mod adapter;

pub use adapter::{
    ChangeAction, ChangeHooks, DeleteOutcome, EntityAdapter, EntityChangeHook, EntityKind,
    EntityRecord, EntityRegistry,
};
