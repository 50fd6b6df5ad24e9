//! Connection slot arena.
//!
//! A fixed number of slots with an intrusive free list threaded through
//! them: acquire pops the head, release pushes the slot back, both O(1).
//! Slots and their buffers are reused across client lifetimes; memory is
//! never returned to the allocator while the pool lives.

use std::net::TcpStream;

use crate::server::conn::Connection;

/// When a slot's buffers get allocated.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferPolicy {
    /// All slot buffers are allocated when the pool is built.
    Eager,
    /// A slot's buffers are allocated the first time it is acquired and
    /// retained afterwards.
    Lazy,
}

pub struct ConnectionPool {
    slots: Box<[Connection]>,
    free_head: i32,
    active: usize,
    request_buf_size: usize,
    chunk_size: usize,
    policy: BufferPolicy,
}

impl ConnectionPool {
    pub fn new(
        capacity: usize,
        request_buf_size: usize,
        chunk_size: usize,
        policy: BufferPolicy,
    ) -> Self {
        assert!(capacity > 0 && capacity <= i32::MAX as usize);

        let mut slots = Vec::with_capacity(capacity);
        for i in 0..capacity {
            let mut conn = Connection::new_slot();
            conn.next_free = if i + 1 == capacity { -1 } else { (i + 1) as i32 };
            if policy == BufferPolicy::Eager {
                conn.ensure_buffers(request_buf_size, chunk_size);
            }
            slots.push(conn);
        }

        Self {
            slots: slots.into_boxed_slice(),
            free_head: 0,
            active: 0,
            request_buf_size,
            chunk_size,
            policy,
        }
    }

    /// Admits a socket into a free slot. Returns `None` when the pool is
    /// exhausted; the caller drops the socket, closing it with no response.
    pub fn acquire(&mut self, stream: TcpStream) -> Option<usize> {
        if self.free_head < 0 {
            return None;
        }

        let idx = self.free_head as usize;
        let conn = &mut self.slots[idx];
        self.free_head = conn.next_free;
        conn.next_free = -1;

        if self.policy == BufferPolicy::Lazy {
            conn.ensure_buffers(self.request_buf_size, self.chunk_size);
        }
        conn.open(stream);

        self.active += 1;
        Some(idx)
    }

    /// Returns a slot to the free list, closing its socket and any open
    /// file. Call sites only release slots they know to be active; a
    /// release of a free slot is a bug and is ignored.
    pub fn release(&mut self, idx: usize) {
        let conn = &mut self.slots[idx];
        if conn.is_free() {
            debug_assert!(false, "released a free slot");
            return;
        }

        conn.reset();
        conn.next_free = self.free_head;
        self.free_head = idx as i32;
        self.active -= 1;
    }

    pub fn get(&self, idx: usize) -> &Connection {
        &self.slots[idx]
    }

    pub fn get_mut(&mut self, idx: usize) -> &mut Connection {
        &mut self.slots[idx]
    }

    pub fn active(&self) -> usize {
        self.active
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{TcpListener, TcpStream};

    fn streams(n: usize) -> Vec<TcpStream> {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        (0..n)
            .map(|_| {
                let client = TcpStream::connect(addr).unwrap();
                let (server, _) = listener.accept().unwrap();
                drop(client);
                server
            })
            .collect()
    }

    #[test]
    fn acquire_is_bounded_by_capacity() {
        let mut pool = ConnectionPool::new(2, 512, 1024, BufferPolicy::Eager);
        let mut sockets = streams(3);

        let a = pool.acquire(sockets.remove(0));
        let b = pool.acquire(sockets.remove(0));
        assert!(a.is_some());
        assert!(b.is_some());
        assert_eq!(pool.active(), 2);

        // Third simultaneous connection finds no slot.
        assert!(pool.acquire(sockets.remove(0)).is_none());
        assert_eq!(pool.active(), 2);
    }

    #[test]
    fn release_makes_the_slot_reusable() {
        let mut pool = ConnectionPool::new(1, 512, 1024, BufferPolicy::Lazy);
        let mut sockets = streams(2);

        let idx = pool.acquire(sockets.remove(0)).unwrap();
        pool.release(idx);
        assert_eq!(pool.active(), 0);

        let again = pool.acquire(sockets.remove(0)).unwrap();
        assert_eq!(again, idx);
        assert_eq!(pool.active(), 1);
    }

    #[test]
    fn freed_slots_are_actually_free() {
        let mut pool = ConnectionPool::new(2, 512, 1024, BufferPolicy::Eager);
        let mut sockets = streams(2);

        let a = pool.acquire(sockets.remove(0)).unwrap();
        assert!(!pool.get(a).is_free());

        pool.release(a);
        assert!(pool.get(a).is_free());

        let b = pool.acquire(sockets.remove(0)).unwrap();
        assert!(!pool.get(b).is_free());
    }
}
