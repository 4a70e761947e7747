use std::hash::Hash;
use std::hash::Hasher;

/// Deterministic 64-bit FNV-1a hasher. Snapshot headers persist its output, so
/// it must never depend on process-local seeds.
struct StableHasher(u64);

impl StableHasher {
  const OFFSET: u64 = 0xcbf29ce484222325;
  const PRIME: u64 = 0x100000001b3;

  fn new() -> Self {
    StableHasher(Self::OFFSET)
  }
}

impl Hasher for StableHasher {
  fn finish(&self) -> u64 {
    self.0
  }

  fn write(&mut self, bytes: &[u8]) {
    for b in bytes {
      self.0 ^= *b as u64;
      self.0 = self.0.wrapping_mul(Self::PRIME);
    }
  }
}

fn fold(hash: u64) -> u32 {
  (hash ^ (hash >> 32)) as u32
}

/// Stable 32-bit hash of any `Hash`able value, folded from the 64-bit FNV-1a
/// output.
pub(crate) fn stable_hash_u32<T: Hash + ?Sized>(value: &T) -> u32 {
  let mut hasher = StableHasher::new();
  value.hash(&mut hasher);
  fold(hasher.finish())
}

/// Stable 32-bit hash of raw bytes, without the length prefix `Hash` adds.
pub(crate) fn stable_hash_bytes(bytes: &[u8]) -> u32 {
  let mut hasher = StableHasher::new();
  hasher.write(bytes);
  fold(hasher.finish())
}
