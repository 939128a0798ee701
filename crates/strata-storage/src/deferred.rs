//! The deferred-reference buffer.
//!
//! A reference column cannot be filled in while its target is itself
//! mid-insertion higher up the save call stack (a cycle). The engine writes
//! the column as NULL, queues a [`DeferredReference`] keyed by the target's
//! arena handle, and patches the column with an UPDATE once the target's
//! full stack has been written. The buffer lives for exactly one save
//! operation; anything left in it at the end is an invariant failure.

use strata_core::Handle;

/// One postponed foreign-key write.
#[derive(Debug, Clone, PartialEq)]
pub struct DeferredReference {
    /// Table holding the NULL column awaiting the id.
    pub owner_table: String,
    /// Column to patch.
    pub column: String,
    /// Row to patch.
    pub owner_id: i64,
    /// Relation name for the retroactive ownership edge.
    pub relation: String,
    /// Identity of the object the column should point at.
    pub referenced: Handle,
    /// Declared class of the column; the target's id is cast to this level.
    pub referenced_class: String,
}

/// Buffer of deferred references for one save operation, keyed by the
/// identity of the referenced object.
#[derive(Debug, Default)]
pub struct DeferredReferenceBuffer {
    records: Vec<DeferredReference>,
}

impl DeferredReferenceBuffer {
    pub fn new() -> Self {
        DeferredReferenceBuffer {
            records: Vec::new(),
        }
    }

    pub fn push(&mut self, record: DeferredReference) {
        self.records.push(record);
    }

    /// Removes and returns every record waiting on `target`.
    pub fn take_for(&mut self, target: Handle) -> Vec<DeferredReference> {
        let mut taken = Vec::new();
        let mut kept = Vec::with_capacity(self.records.len());
        for record in self.records.drain(..) {
            if record.referenced == target {
                taken.push(record);
            } else {
                kept.push(record);
            }
        }
        self.records = kept;
        taken
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    /// Declared class of the first unresolved record, for error reporting.
    pub fn first_unresolved_class(&self) -> Option<&str> {
        self.records.first().map(|r| r.referenced_class.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(owner_id: i64, referenced: Handle) -> DeferredReference {
        DeferredReference {
            owner_table: "NODE".into(),
            column: "NEXT".into(),
            owner_id,
            relation: "NEXT".into(),
            referenced,
            referenced_class: "Node".into(),
        }
    }

    #[test]
    fn take_for_removes_only_matching_records() {
        let mut buffer = DeferredReferenceBuffer::new();
        buffer.push(record(1, Handle(7)));
        buffer.push(record(2, Handle(8)));
        buffer.push(record(3, Handle(7)));

        let taken = buffer.take_for(Handle(7));
        assert_eq!(taken.len(), 2);
        assert_eq!(taken[0].owner_id, 1);
        assert_eq!(taken[1].owner_id, 3);

        assert_eq!(buffer.len(), 1);
        assert!(!buffer.is_empty());
        assert_eq!(buffer.first_unresolved_class(), Some("Node"));
    }

    #[test]
    fn identity_keying_distinguishes_equal_objects() {
        // Two records that differ only in handle identity must not be
        // conflated.
        let mut buffer = DeferredReferenceBuffer::new();
        buffer.push(record(1, Handle(7)));
        buffer.push(record(1, Handle(9)));

        assert_eq!(buffer.take_for(Handle(9)).len(), 1);
        assert_eq!(buffer.take_for(Handle(7)).len(), 1);
        assert!(buffer.is_empty());
    }

    #[test]
    fn take_for_on_empty_buffer_is_empty() {
        let mut buffer = DeferredReferenceBuffer::new();
        assert!(buffer.take_for(Handle(1)).is_empty());
    }
}
