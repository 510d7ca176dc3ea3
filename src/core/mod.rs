// Copyright 2021-2024 The paratrace developers.
// Licensed under the GNU GPLv3 license (https://opensource.org/licenses/GPL-3.0)
// This file may not be copied, modified, or distributed
// except according to those terms.

//! The reactive computation-graph protocol: event streams, dirty tracking and
//! reversible snapshots. Nodes compose the three capabilities freely; the
//! graph is acyclic and all notification is synchronous and depth-first
//! within a single chain.

pub mod cache;
pub mod checkpoint;
pub mod computation;
pub mod events;
pub mod ordering;
pub mod parameter;

/// Delegate [`cache::Cacheable`] to a [`cache::DirtyCell`] field.
#[macro_export]
macro_rules! impl_cacheable {
    ($ty:ty, $cell:ident) => {
        impl $crate::core::cache::Cacheable for $ty {
            fn is_dirty(&self) -> bool {
                self.$cell.is_dirty()
            }
            fn set_dirty(&self) {
                self.$cell.set_dirty();
            }
            fn set_clean(&self) {
                self.$cell.set_clean();
            }
            fn add_dirty_listener(
                &self,
                listener: $crate::core::cache::DirtyListener,
            ) -> $crate::core::events::ListenerId {
                self.$cell.add_listener(listener)
            }
            fn remove_dirty_listener(&self, id: $crate::core::events::ListenerId) -> bool {
                self.$cell.remove_listener(id)
            }
        }
    };
}

/// Delegate [`checkpoint::Checkpointable`] to a [`checkpoint::CheckpointCell`]
/// field snapshotting a `Cell`-stored value.
#[macro_export]
macro_rules! impl_checkpointable_cell {
    ($ty:ty, $ckpt:ident, $value:ident) => {
        impl $crate::core::checkpoint::Checkpointable for $ty {
            fn save_state(&self, id: $crate::core::checkpoint::StateId) {
                self.$ckpt.save(id, || self.$value.get());
            }
            fn restore_state(&self, id: $crate::core::checkpoint::StateId) {
                self.$ckpt.restore(id, |v| self.$value.set(v));
            }
            fn accept_state(&self) {
                self.$ckpt.accept();
            }
            fn is_saved(&self) -> bool {
                self.$ckpt.is_saved()
            }
            fn add_state_listener(
                &self,
                listener: $crate::core::checkpoint::StateListener,
            ) -> $crate::core::events::ListenerId {
                self.$ckpt.add_listener(listener)
            }
            fn remove_state_listener(&self, id: $crate::core::events::ListenerId) -> bool {
                self.$ckpt.remove_listener(id)
            }
        }
    };
}

/// Delegate [`checkpoint::Checkpointable`] to a [`checkpoint::CheckpointCell`]
/// field snapshotting a `RefCell`-stored value.
#[macro_export]
macro_rules! impl_checkpointable_refcell {
    ($ty:ty, $ckpt:ident, $value:ident) => {
        impl $crate::core::checkpoint::Checkpointable for $ty {
            fn save_state(&self, id: $crate::core::checkpoint::StateId) {
                self.$ckpt.save(id, || self.$value.borrow().clone());
            }
            fn restore_state(&self, id: $crate::core::checkpoint::StateId) {
                self.$ckpt.restore(id, |v| *self.$value.borrow_mut() = v);
            }
            fn accept_state(&self) {
                self.$ckpt.accept();
            }
            fn is_saved(&self) -> bool {
                self.$ckpt.is_saved()
            }
            fn add_state_listener(
                &self,
                listener: $crate::core::checkpoint::StateListener,
            ) -> $crate::core::events::ListenerId {
                self.$ckpt.add_listener(listener)
            }
            fn remove_state_listener(&self, id: $crate::core::events::ListenerId) -> bool {
                self.$ckpt.remove_listener(id)
            }
        }
    };
}
