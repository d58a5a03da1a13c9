/// Keeps the most recent `capacity` values, evicting the oldest when full. A capacity of zero
///  retains nothing.
pub struct ReplayBuffer<T> {
    capacity: usize,
    buf: BufferImpl<T>,
}
impl<T: Clone> ReplayBuffer<T> {
    pub fn new(capacity: usize) -> ReplayBuffer<T> {
        ReplayBuffer {
            capacity,
            buf: BufferImpl::Growing(vec![]),
        }
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }

    pub fn len(&self) -> usize {
        match &self.buf {
            BufferImpl::Growing(buf) => buf.len(),
            BufferImpl::Ring { buf, .. } => buf.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// adds a new value, returning the value that was evicted in its place (if any)
    pub fn add(&mut self, value: T) -> Option<T> {
        if self.capacity == 0 {
            return Some(value);
        }

        match &mut self.buf {
            BufferImpl::Growing(buf) => {
                buf.push(value);
                if buf.len() == self.capacity {
                    let buf = std::mem::take(buf);
                    self.buf = BufferImpl::Ring { buf, next: 0 };
                }
                None
            }
            BufferImpl::Ring { buf, next } => {
                let evicted = std::mem::replace(&mut buf[*next], value);
                *next = (*next + 1) % self.capacity;
                Some(evicted)
            }
        }
    }

    /// the retained values, oldest first
    pub fn snapshot(&self) -> Vec<T> {
        match &self.buf {
            BufferImpl::Growing(buf) => buf.clone(),
            BufferImpl::Ring { buf, next } => {
                let mut result = Vec::with_capacity(buf.len());
                result.extend_from_slice(&buf[*next..]);
                result.extend_from_slice(&buf[..*next]);
                result
            }
        }
    }
}

enum BufferImpl<T> {
    Growing(Vec<T>),
    Ring {
        buf: Vec<T>,
        next: usize,
    },
}
