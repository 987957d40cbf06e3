//! Timestamp-ordered playout buffer with bounded concurrent cursors
//!
//! Nodes live in an arena and are linked by index in strictly ascending
//! timestamp order. Cursors are small handles into a fixed-capacity registry
//! owned by the buffer; every removal relocates the cursors that referenced
//! the removed node, so no cursor ever points at a freed slot.

use tracing::{trace, warn};

use crate::error::{Error, Result};
use crate::time::Timestamp;

/// Maximum number of cursors that may be live on one buffer at a time
pub const MAX_CURSORS: usize = 5;

/// Handle to a cursor registered with a [`PlayoutBuffer`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct CursorId {
    slot: usize,
    generation: u32,
}

#[derive(Debug)]
struct Node<T> {
    ts: Timestamp,
    payload: T,
    prev: Option<usize>,
    next: Option<usize>,
}

#[derive(Debug, Clone, Copy, Default)]
struct CursorSlot {
    generation: u32,
    live: bool,
    /// `None` is the sentinel position before the first node
    position: Option<usize>,
}

/// Ordered container of timestamped payloads
#[derive(Debug)]
pub struct PlayoutBuffer<T> {
    nodes: Vec<Option<Node<T>>>,
    free: Vec<usize>,
    head: Option<usize>,
    tail: Option<usize>,
    len: usize,
    cursors: [CursorSlot; MAX_CURSORS],
}

impl<T> PlayoutBuffer<T> {
    /// Create an empty buffer
    pub fn new() -> Self {
        Self {
            nodes: Vec::new(),
            free: Vec::new(),
            head: None,
            tail: None,
            len: 0,
            cursors: [CursorSlot::default(); MAX_CURSORS],
        }
    }

    /// Number of buffered nodes
    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Number of cursors currently registered
    pub fn live_cursors(&self) -> usize {
        self.cursors.iter().filter(|c| c.live).count()
    }

    fn node(&self, index: usize) -> &Node<T> {
        // Linked indices always refer to occupied slots.
        match self.nodes[index].as_ref() {
            Some(node) => node,
            None => unreachable!("linked index {index} refers to a free slot"),
        }
    }

    fn node_mut(&mut self, index: usize) -> &mut Node<T> {
        match self.nodes[index].as_mut() {
            Some(node) => node,
            None => unreachable!("linked index {index} refers to a free slot"),
        }
    }

    /// Timestamp of the oldest node
    pub fn first_timestamp(&self) -> Option<Timestamp> {
        self.head.map(|i| self.node(i).ts)
    }

    /// Timestamp of the newest node
    pub fn last_timestamp(&self) -> Option<Timestamp> {
        self.tail.map(|i| self.node(i).ts)
    }

    /// Whether anything is buffered at or after `now`
    pub fn is_relevant(&self, now: Timestamp) -> bool {
        self.last_timestamp().map_or(false, |last| last >= now)
    }

    /// Insert a payload in timestamp order
    ///
    /// The search starts from the tail because arrivals are nearly monotonic.
    /// A node with exactly the same timestamp is never overwritten: the call
    /// fails with [`Error::DuplicateTimestamp`] and the buffer is unchanged.
    pub fn add(&mut self, payload: T, ts: Timestamp) -> Result<()> {
        let mut after = self.tail;
        while let Some(index) = after {
            let node = self.node(index);
            if node.ts == ts {
                trace!("Rejecting duplicate timestamp {}", ts);
                return Err(Error::DuplicateTimestamp);
            }
            if node.ts < ts {
                break;
            }
            after = node.prev;
        }

        let next = match after {
            Some(index) => self.node(index).next,
            None => self.head,
        };
        let node = Node {
            ts,
            payload,
            prev: after,
            next,
        };
        let index = match self.free.pop() {
            Some(index) => {
                self.nodes[index] = Some(node);
                index
            }
            None => {
                self.nodes.push(Some(node));
                self.nodes.len() - 1
            }
        };

        match after {
            Some(prev) => self.node_mut(prev).next = Some(index),
            None => self.head = Some(index),
        }
        match next {
            Some(next) => self.node_mut(next).prev = Some(index),
            None => self.tail = Some(index),
        }
        self.len += 1;
        Ok(())
    }

    /// Release every node and park all cursors on the sentinel
    pub fn flush(&mut self) {
        self.nodes.clear();
        self.free.clear();
        self.head = None;
        self.tail = None;
        self.len = 0;
        for cursor in self.cursors.iter_mut().filter(|c| c.live) {
            cursor.position = None;
        }
    }

    /// Move every node's timestamp later by `delta`
    pub fn shift_forward(&mut self, delta: Timestamp) {
        for node in self.nodes.iter_mut().flatten() {
            node.ts = node.ts + delta;
        }
    }

    /// Move every node's timestamp earlier by `delta`
    pub fn shift_backward(&mut self, delta: Timestamp) {
        for node in self.nodes.iter_mut().flatten() {
            node.ts = node.ts - delta;
        }
    }

    /// Mutable access to the payload stored at exactly `ts`
    pub fn find_mut(&mut self, ts: Timestamp) -> Option<&mut T> {
        let mut cursor = self.tail;
        while let Some(index) = cursor {
            let node = self.node(index);
            if node.ts == ts {
                return Some(&mut self.node_mut(index).payload);
            }
            if node.ts < ts {
                return None;
            }
            cursor = node.prev;
        }
        None
    }

    /// Iterate nodes in ascending timestamp order
    pub fn iter(&self) -> Iter<'_, T> {
        Iter {
            buffer: self,
            next: self.head,
        }
    }

    /// Register a new cursor, positioned on the sentinel
    pub fn create_cursor(&mut self) -> Result<CursorId> {
        let slot = self
            .cursors
            .iter()
            .position(|c| !c.live)
            .ok_or_else(|| Error::ResourceExhausted(format!("all {} buffer cursors in use", MAX_CURSORS)))?;
        let cursor = &mut self.cursors[slot];
        cursor.generation = cursor.generation.wrapping_add(1);
        cursor.live = true;
        cursor.position = None;
        Ok(CursorId {
            slot,
            generation: cursor.generation,
        })
    }

    /// Unregister a cursor; the handle becomes invalid
    pub fn destroy_cursor(&mut self, id: CursorId) -> Result<()> {
        self.slot(id)?;
        self.cursors[id.slot].live = false;
        self.cursors[id.slot].position = None;
        Ok(())
    }

    /// Register a new cursor at the same position as `id`
    pub fn dup_cursor(&mut self, id: CursorId) -> Result<CursorId> {
        let position = self.slot(id)?.position;
        let dup = self.create_cursor()?;
        self.cursors[dup.slot].position = position;
        Ok(dup)
    }

    fn slot(&self, id: CursorId) -> Result<&CursorSlot> {
        match self.cursors.get(id.slot) {
            Some(slot) if slot.live && slot.generation == id.generation => Ok(slot),
            _ => Err(Error::InvalidCursor),
        }
    }

    fn position(&self, id: CursorId) -> Result<Option<usize>> {
        Ok(self.slot(id)?.position)
    }

    fn set_position(&mut self, id: CursorId, position: Option<usize>) {
        self.cursors[id.slot].position = position;
    }

    /// Timestamp of the node under the cursor (`None` on the sentinel)
    pub fn cursor_timestamp(&self, id: CursorId) -> Result<Option<Timestamp>> {
        Ok(self.position(id)?.map(|i| self.node(i).ts))
    }

    /// Peek at the node under the cursor
    pub fn get_at(&self, id: CursorId) -> Result<Option<(&T, Timestamp)>> {
        Ok(self.position(id)?.map(|i| {
            let node = self.node(i);
            (&node.payload, node.ts)
        }))
    }

    /// Mutable peek at the node under the cursor
    pub fn get_at_mut(&mut self, id: CursorId) -> Result<Option<(&mut T, Timestamp)>> {
        Ok(match self.position(id)? {
            Some(i) => {
                let node = self.node_mut(i);
                Some((&mut node.payload, node.ts))
            }
            None => None,
        })
    }

    /// Peek at the node after the cursor (the first node when on the sentinel)
    pub fn peek_next(&self, id: CursorId) -> Result<Option<(&T, Timestamp)>> {
        let next = match self.position(id)? {
            Some(i) => self.node(i).next,
            None => self.head,
        };
        Ok(next.map(|i| {
            let node = self.node(i);
            (&node.payload, node.ts)
        }))
    }

    /// Remove and return the node under the cursor
    ///
    /// The cursor advances to the removed node's successor (the sentinel if
    /// it was the last node). Any other cursor on the removed node retreats
    /// to its predecessor.
    pub fn detach_at(&mut self, id: CursorId) -> Result<Option<(T, Timestamp)>> {
        let index = match self.position(id)? {
            Some(index) => index,
            None => return Ok(None),
        };
        let (prev, next) = {
            let node = self.node(index);
            (node.prev, node.next)
        };

        for (slot, cursor) in self.cursors.iter_mut().enumerate() {
            if cursor.live && cursor.position == Some(index) && slot != id.slot {
                cursor.position = prev;
            }
        }
        self.set_position(id, next);

        match prev {
            Some(p) => self.node_mut(p).next = next,
            None => self.head = next,
        }
        match next {
            Some(n) => self.node_mut(n).prev = prev,
            None => self.tail = prev,
        }

        self.len -= 1;
        self.free.push(index);
        Ok(self.nodes[index].take().map(|node| (node.payload, node.ts)))
    }

    /// Step to the next node; returns `false` (and stays put) at the end
    pub fn advance(&mut self, id: CursorId) -> Result<bool> {
        let next = match self.position(id)? {
            Some(i) => self.node(i).next,
            None => self.head,
        };
        match next {
            Some(next) => {
                self.set_position(id, Some(next));
                Ok(true)
            }
            None => Ok(false),
        }
    }

    /// Step to the previous node; stepping back from the first node parks
    /// the cursor on the sentinel, stepping back from the sentinel goes to
    /// the last node
    pub fn retreat(&mut self, id: CursorId) -> Result<bool> {
        match self.position(id)? {
            Some(i) => {
                let prev = self.node(i).prev;
                self.set_position(id, prev);
                Ok(true)
            }
            None => match self.tail {
                Some(tail) => {
                    self.set_position(id, Some(tail));
                    Ok(true)
                }
                None => Ok(false),
            },
        }
    }

    /// Move the cursor to the last node (the sentinel when empty)
    pub fn fast_forward(&mut self, id: CursorId) -> Result<()> {
        self.slot(id)?;
        let tail = self.tail;
        self.set_position(id, tail);
        Ok(())
    }

    /// Move the cursor back to the sentinel before the first node
    pub fn rewind(&mut self, id: CursorId) -> Result<()> {
        self.slot(id)?;
        self.set_position(id, None);
        Ok(())
    }

    /// Trim history older than `cursor timestamp - max_history`
    ///
    /// Trimming proceeds from the oldest node and stops at the first node
    /// that is recent enough or that any live cursor references. Returns the
    /// number of nodes removed.
    pub fn audit(&mut self, id: CursorId, max_history: Timestamp) -> Result<usize> {
        let cutoff = match self.cursor_timestamp(id)? {
            Some(ts) => ts - max_history,
            None => return Ok(0),
        };

        let mut removed = 0;
        while let Some(head) = self.head {
            let node = self.node(head);
            if node.ts >= cutoff {
                break;
            }
            if self.cursors.iter().any(|c| c.live && c.position == Some(head)) {
                break;
            }
            let next = node.next;
            self.head = next;
            match next {
                Some(n) => self.node_mut(n).prev = None,
                None => self.tail = None,
            }
            self.nodes[head] = None;
            self.free.push(head);
            self.len -= 1;
            removed += 1;
        }
        if removed > 0 {
            trace!("Audit trimmed {} nodes older than {}", removed, cutoff);
        }
        Ok(removed)
    }
}

impl<T> Default for PlayoutBuffer<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Drop for PlayoutBuffer<T> {
    fn drop(&mut self) {
        let live = self.live_cursors();
        if live > 0 {
            warn!("Playout buffer dropped with {} live cursors", live);
        }
    }
}

/// Ascending iterator over a [`PlayoutBuffer`]
pub struct Iter<'a, T> {
    buffer: &'a PlayoutBuffer<T>,
    next: Option<usize>,
}

impl<'a, T> Iterator for Iter<'a, T> {
    type Item = (Timestamp, &'a T);

    fn next(&mut self) -> Option<Self::Item> {
        let index = self.next?;
        let node = self.buffer.node(index);
        self.next = node.next;
        Some((node.ts, &node.payload))
    }
}
