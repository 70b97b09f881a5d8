use std::time::Duration;

use tokio::time::Instant;

use super::*;

/// Queued value fragment of a prepared write.
#[derive(Clone, Debug, Eq, PartialEq)]
pub(crate) struct Fragment {
    hdl: Handle,
    off: u16,
    val: Value,
}

/// Per-connection queue of prepared writes
/// ([Vol 3] Part F, Section 3.4.6). Fragments are ordered by handle and
/// offset. Fragments with an equal handle and offset keep their arrival order.
#[derive(Debug)]
pub(crate) struct PrepareQueue {
    frags: Vec<Fragment>,
    cap: usize,
    timeout: Duration,
    deadline: Option<Instant>,
}

impl PrepareQueue {
    /// Creates an empty queue that holds at most `cap` fragments and is
    /// discarded if idle for longer than `timeout`.
    #[must_use]
    pub fn new(cap: usize, timeout: Duration) -> Self {
        Self {
            frags: Vec::new(),
            cap,
            timeout,
            deadline: None,
        }
    }

    /// Returns the number of queued fragments.
    #[inline(always)]
    #[must_use]
    pub fn len(&self) -> usize {
        self.frags.len()
    }

    /// Returns whether the queue is empty.
    #[inline(always)]
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.frags.is_empty()
    }

    /// Returns the time when the queue will be discarded, if any.
    #[inline(always)]
    #[must_use]
    pub const fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Inserts a fragment and restarts the idle timer. Offsets are not
    /// validated until the queue is executed.
    pub fn push(&mut self, hdl: Handle, off: u16, val: &[u8]) -> IoResult {
        if self.frags.len() >= self.cap {
            return Err(ErrorCode::PrepareQueueFull);
        }
        let i = (self.frags).partition_point(|f| (f.hdl, f.off) <= (hdl, off));
        let val = Value::from_slice(val);
        self.frags.insert(i, Fragment { hdl, off, val });
        self.deadline = Some(Instant::now() + self.timeout);
        Ok(())
    }

    /// Verifies that the fragments of each handle form a contiguous value
    /// starting at offset 0 that is no longer than `max_len`. Returns the
    /// first offending handle and the error.
    pub fn validate(&self, max_len: usize) -> std::result::Result<(), (Handle, ErrorCode)> {
        let mut prev: Option<&Fragment> = None;
        for f in &self.frags {
            let want = match prev {
                Some(p) if p.hdl == f.hdl => usize::from(p.off) + p.val.len(),
                _ => 0,
            };
            if usize::from(f.off) != want {
                return Err((f.hdl, ErrorCode::InvalidOffset));
            }
            if usize::from(f.off) + f.val.len() > max_len {
                return Err((f.hdl, ErrorCode::InvalidAttributeValueLength));
            }
            prev = Some(f);
        }
        Ok(())
    }

    /// Empties the queue, returning the reassembled value of each handle in
    /// queue order.
    pub fn take(&mut self) -> Vec<(Handle, Value)> {
        self.deadline = None;
        let mut out: Vec<(Handle, Value)> = Vec::new();
        for f in self.frags.drain(..) {
            if let Some((hdl, v)) = out.last_mut() {
                if *hdl == f.hdl {
                    v.extend_from_slice(&f.val);
                    continue;
                }
            }
            out.push((f.hdl, f.val));
        }
        out
    }

    /// Discards all fragments.
    #[inline]
    pub fn clear(&mut self) {
        self.frags.clear();
        self.deadline = None;
    }

    /// Discards all fragments if the idle timer expired at `now`. Returns
    /// whether the queue was discarded.
    pub fn expire(&mut self, now: Instant) -> bool {
        match self.deadline {
            Some(t) if t <= now => {
                self.clear();
                true
            }
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn h(v: u16) -> Handle {
        Handle::new(v).unwrap()
    }

    fn queue() -> PrepareQueue {
        PrepareQueue::new(8, Duration::from_secs(30))
    }

    #[test]
    fn ordering() {
        let mut q = queue();
        q.push(h(7), 0, b"x").unwrap();
        q.push(h(5), 2, &[3, 4]).unwrap();
        q.push(h(5), 0, &[1, 2]).unwrap();
        q.push(h(5), 2, &[5]).unwrap();
        let order: Vec<_> = q.frags.iter().map(|f| (u16::from(f.hdl), f.off)).collect();
        assert_eq!(order, [(5, 0), (5, 2), (5, 2), (7, 0)]);
        assert_eq!(q.frags[1].val.as_slice(), &[3, 4]);
        assert_eq!(q.validate(512), Err((h(5), ErrorCode::InvalidOffset)));
    }

    #[test]
    fn validate() {
        let mut q = queue();
        q.push(h(5), 0, &[1, 2]).unwrap();
        q.push(h(5), 2, &[3, 4]).unwrap();
        q.push(h(6), 0, &[9]).unwrap();
        assert_eq!(q.validate(512), Ok(()));
        assert_eq!(
            q.validate(3),
            Err((h(5), ErrorCode::InvalidAttributeValueLength))
        );
        let v = q.take();
        assert!(q.is_empty());
        assert_eq!(v.len(), 2);
        assert_eq!((v[0].0, v[0].1.as_slice()), (h(5), &[1, 2, 3, 4][..]));
        assert_eq!((v[1].0, v[1].1.as_slice()), (h(6), &[9][..]));

        q.push(h(5), 0, &[1, 2]).unwrap();
        q.push(h(5), 3, &[3, 4]).unwrap();
        assert_eq!(q.validate(512), Err((h(5), ErrorCode::InvalidOffset)));
        q.clear();
        q.push(h(5), 1, &[1]).unwrap();
        assert_eq!(q.validate(512), Err((h(5), ErrorCode::InvalidOffset)));
    }

    #[test]
    fn capacity() {
        let mut q = PrepareQueue::new(2, Duration::from_secs(30));
        q.push(h(1), 0, b"a").unwrap();
        q.push(h(1), 1, b"b").unwrap();
        assert_eq!(q.push(h(1), 2, b"c"), Err(ErrorCode::PrepareQueueFull));
        assert_eq!(q.len(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn idle_timer() {
        let mut q = queue();
        assert_eq!(q.deadline(), None);
        q.push(h(1), 0, b"a").unwrap();
        let first = q.deadline().unwrap();
        tokio::time::advance(Duration::from_secs(20)).await;
        q.push(h(1), 1, b"b").unwrap();
        assert!(q.deadline().unwrap() > first);
        tokio::time::advance(Duration::from_secs(20)).await;
        assert!(!q.expire(Instant::now()));
        tokio::time::advance(Duration::from_secs(10)).await;
        assert!(q.expire(Instant::now()));
        assert!(q.is_empty());
        assert_eq!(q.deadline(), None);
    }
}
