use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::Mutex;

use crate::util::random::{Random, RngRandom};

const DIGITS: &[u8; 62] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZabcdefghijklmnopqrstuvwxyz";
const BASE: u64 = 62;
const PREFIX_LEN: usize = 12;
const SEQ_LEN: usize = 10;
const MAX_SEQ: u64 = 839_299_365_868_340_224; // 62^10
const MIN_INC: u64 = 33;
const MAX_INC: u64 = 333;

/// Generator of unique 22 character identifiers: a random prefix followed by a sequence that
///  advances by a random increment, with a fresh prefix when the sequence overflows.
pub struct Nuid {
    prefix: [u8; PREFIX_LEN],
    seq: u64,
    inc: u64,
}
impl Default for Nuid {
    fn default() -> Self {
        Nuid::new::<RngRandom>()
    }
}
impl Nuid {
    pub fn new<R: Random>() -> Nuid {
        let mut nuid = Nuid {
            prefix: [0; PREFIX_LEN],
            seq: R::gen_u64_range(0..MAX_SEQ),
            inc: R::gen_u64_range(MIN_INC..MAX_INC),
        };
        nuid.randomize_prefix::<R>();
        nuid
    }

    fn randomize_prefix<R: Random>(&mut self) {
        for b in self.prefix.iter_mut() {
            *b = DIGITS[R::gen_usize_range(0..DIGITS.len())];
        }
    }

    pub fn next<R: Random>(&mut self) -> String {
        self.seq += self.inc;
        if self.seq >= MAX_SEQ {
            self.randomize_prefix::<R>();
            self.seq = R::gen_u64_range(0..MAX_SEQ);
            self.inc = R::gen_u64_range(MIN_INC..MAX_INC);
        }

        let mut result = [0u8; PREFIX_LEN + SEQ_LEN];
        result[..PREFIX_LEN].copy_from_slice(&self.prefix);
        let mut seq = self.seq;
        for b in result[PREFIX_LEN..].iter_mut().rev() {
            *b = DIGITS[(seq % BASE) as usize];
            seq /= BASE;
        }
        result.iter().map(|&b| b as char).collect()
    }
}

/// Creates unique reply subjects below a configured prefix
pub struct InboxFactory {
    prefix: String,
    nuid: Mutex<Nuid>,
}
impl InboxFactory {
    pub fn new(prefix: impl Into<String>) -> InboxFactory {
        InboxFactory {
            prefix: prefix.into(),
            nuid: Mutex::new(Nuid::default()),
        }
    }

    pub fn new_inbox(&self) -> String {
        let id = self.nuid.lock().next::<RngRandom>();
        format!("{}.{}", self.prefix, id)
    }
}

/// Subscription ids, shared by subscriptions and requests so they never collide on one connection
#[derive(Default)]
pub struct SidAllocator {
    last: AtomicU64,
}
impl SidAllocator {
    pub fn new() -> SidAllocator {
        SidAllocator::default()
    }

    pub fn next(&self) -> u64 {
        self.last.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::util::random::{MockRandom, MOCK_RANDOM_MUTEX};
    use rustc_hash::FxHashSet;

    #[test]
    fn test_nuid_format_and_uniqueness() {
        let mut nuid = Nuid::default();
        let mut seen = FxHashSet::default();
        for _ in 0..10_000 {
            let id = nuid.next::<RngRandom>();
            assert_eq!(id.len(), 22);
            assert!(id.bytes().all(|b| b.is_ascii_alphanumeric()));
            assert!(seen.insert(id));
        }
    }

    #[test]
    fn test_nuid_sequence_overflow_renews_prefix() {
        let _lock = MOCK_RANDOM_MUTEX.lock();

        let ctx_usize = MockRandom::gen_usize_range_context();
        ctx_usize.expect().returning(|_| 0);
        let ctx_u64 = MockRandom::gen_u64_range_context();
        ctx_u64.expect().returning(|r| if r.start == MIN_INC { 100 } else { MAX_SEQ - 150 });

        let mut nuid = Nuid::new::<MockRandom>();
        assert_eq!(nuid.next::<MockRandom>(), format!("000000000000{}", encode_seq(MAX_SEQ - 50)));

        ctx_usize.checkpoint();
        ctx_usize.expect().returning(|_| 1);
        assert_eq!(nuid.next::<MockRandom>(), format!("111111111111{}", encode_seq(MAX_SEQ - 150)));
    }

    fn encode_seq(mut seq: u64) -> String {
        let mut digits = vec![];
        for _ in 0..SEQ_LEN {
            digits.push(DIGITS[(seq % BASE) as usize] as char);
            seq /= BASE;
        }
        digits.into_iter().rev().collect()
    }

    #[test]
    fn test_inbox() {
        let factory = InboxFactory::new("_INBOX");
        let a = factory.new_inbox();
        let b = factory.new_inbox();
        assert!(a.starts_with("_INBOX."));
        assert_eq!(a.len(), "_INBOX.".len() + 22);
        assert_ne!(a, b);
    }

    #[test]
    fn test_sids_are_unique_and_positive() {
        let sids = SidAllocator::new();
        assert_eq!(sids.next(), 1);
        assert_eq!(sids.next(), 2);
    }
}
