//! Resume cursor for batch runs.

use serde::{Deserialize, Serialize};

use crate::id::ItemId;

/// Position marker for a batch run: the last item id included in a fully
/// completed chunk.
///
/// Batch work walks items in ascending [`ItemId`] order, so a cursor is only
/// ever meaningful as "resume strictly after this item".
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Cursor(ItemId);

impl Cursor {
    pub const fn after(item_id: ItemId) -> Self {
        Self(item_id)
    }

    pub const fn item_id(self) -> ItemId {
        self.0
    }

    /// Whether `item_id` lies strictly past this cursor.
    pub fn admits(self, item_id: ItemId) -> bool {
        item_id > self.0
    }
}

impl core::fmt::Display for Cursor {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "after:{}", self.0)
    }
}

impl From<ItemId> for Cursor {
    fn from(value: ItemId) -> Self {
        Self(value)
    }
}
