//! Keyed texture pool.
//!
//! Textures are bucketed by exact `(width, height, usage)`. Reuse within a
//! bucket is FIFO and a request never receives a texture from another
//! bucket, even a larger one.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::ops::Deref;
use std::sync::Arc;

use tracing::{debug, trace, warn};

use crate::backend::{GpuPrimitives, GpuTexture, TextureDesc, UsageClass};
use crate::GpuResult;

/// Key identifying a texture bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TextureKey {
    /// Width in pixels.
    pub width: u32,
    /// Height in pixels.
    pub height: u32,
    /// Usage bucket.
    pub usage: UsageClass,
}

impl TextureKey {
    pub fn new(width: u32, height: u32, usage: UsageClass) -> Self {
        Self { width, height, usage }
    }
}

/// A texture lent out by a [`TexturePool`]. Return it with
/// [`TexturePool::release`].
pub struct PooledTexture<G: GpuPrimitives> {
    texture: Arc<G::Texture>,
    id: u64,
    key: TextureKey,
}

impl<G: GpuPrimitives> PooledTexture<G> {
    /// Bucket this texture belongs to.
    pub fn key(&self) -> TextureKey {
        self.key
    }

    /// Pool-assigned identity, stable across reuse.
    pub fn id(&self) -> u64 {
        self.id
    }
}

impl<G: GpuPrimitives> Deref for PooledTexture<G> {
    type Target = G::Texture;

    fn deref(&self) -> &G::Texture {
        &self.texture
    }
}

impl<G: GpuPrimitives> fmt::Debug for PooledTexture<G> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PooledTexture")
            .field("id", &self.id)
            .field("key", &self.key)
            .finish()
    }
}

/// Pool counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TexturePoolStats {
    /// Acquires served from a free bucket.
    pub hits: u64,
    /// Acquires that had to allocate.
    pub misses: u64,
    /// Textures allocated over the pool's life.
    pub created: u64,
    /// Textures currently free.
    pub free: usize,
    /// Textures currently lent out.
    pub in_use: usize,
}

struct Entry<T> {
    texture: Arc<T>,
    id: u64,
}

/// Pool of RGBA8 textures keyed by size and usage.
pub struct TexturePool<G: GpuPrimitives> {
    device: Arc<G>,
    /// Free textures per bucket (front = oldest).
    free: HashMap<TextureKey, VecDeque<Entry<G::Texture>>>,
    /// Lent textures by id.
    in_use: HashMap<u64, Arc<G::Texture>>,
    next_id: u64,
    hits: u64,
    misses: u64,
    created: u64,
}

impl<G: GpuPrimitives> TexturePool<G> {
    /// Empty pool allocating from `device`.
    pub fn new(device: Arc<G>) -> Self {
        Self {
            device,
            free: HashMap::new(),
            in_use: HashMap::new(),
            next_id: 0,
            hits: 0,
            misses: 0,
            created: 0,
        }
    }

    /// Lend a texture for `(width, height, usage)`, allocating when the
    /// bucket is empty. Allocation failure is the only error.
    pub fn acquire(&mut self, width: u32, height: u32, usage: UsageClass, label: &str) -> GpuResult<PooledTexture<G>> {
        let key = TextureKey::new(width, height, usage);
        let entry = match self.free.get_mut(&key).and_then(VecDeque::pop_front) {
            Some(entry) => {
                self.hits += 1;
                trace!(id = entry.id, width, height, ?usage, "texture pool hit");
                entry
            }
            None => {
                self.misses += 1;
                let texture = self.device.create_texture(&TextureDesc {
                    label,
                    width,
                    height,
                    usage,
                })?;
                self.created += 1;
                let id = self.next_id;
                self.next_id += 1;
                debug!(id, width, height, ?usage, label, "texture pool allocated");
                Entry {
                    texture: Arc::new(texture),
                    id,
                }
            }
        };

        self.in_use.insert(entry.id, entry.texture.clone());
        Ok(PooledTexture {
            texture: entry.texture,
            id: entry.id,
            key,
        })
    }

    /// Return a texture to its bucket. Textures this pool did not lend (or
    /// lent before a [`clear`](Self::clear)) are ignored with a warning.
    pub fn release(&mut self, texture: PooledTexture<G>) {
        let owned = self
            .in_use
            .get(&texture.id)
            .is_some_and(|t| Arc::ptr_eq(t, &texture.texture));
        if !owned {
            warn!(id = texture.id, key = ?texture.key, "released texture not lent by this pool");
            return;
        }
        self.in_use.remove(&texture.id);
        self.free.entry(texture.key).or_default().push_back(Entry {
            texture: texture.texture,
            id: texture.id,
        });
    }

    /// Destroy every texture, free and lent, and empty the pool.
    pub fn clear(&mut self) {
        let free: usize = self.free.values().map(VecDeque::len).sum();
        let lent = self.in_use.len();
        for entry in self.free.drain().flat_map(|(_, bucket)| bucket) {
            self.device.destroy_texture(&entry.texture);
        }
        for (_, texture) in self.in_use.drain() {
            self.device.destroy_texture(&texture);
        }
        if free + lent > 0 {
            debug!(free, lent, "texture pool cleared");
        }
    }

    /// Bytes held by free and lent textures.
    pub fn memory_bytes(&self) -> u64 {
        let free: u64 = self.free.values().flatten().map(|e| e.texture.size_bytes()).sum();
        let lent: u64 = self.in_use.values().map(|t| t.size_bytes()).sum();
        free + lent
    }

    /// Counters.
    pub fn stats(&self) -> TexturePoolStats {
        TexturePoolStats {
            hits: self.hits,
            misses: self.misses,
            created: self.created,
            free: self.free.values().map(VecDeque::len).sum(),
            in_use: self.in_use.len(),
        }
    }
}

impl<G: GpuPrimitives> Drop for TexturePool<G> {
    fn drop(&mut self) {
        self.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::CpuPrimitives;

    fn pool() -> TexturePool<CpuPrimitives> {
        TexturePool::new(Arc::new(CpuPrimitives::new()))
    }

    #[test]
    fn test_reuse_same_bucket() {
        let mut pool = pool();
        let a = pool.acquire(64, 32, UsageClass::RenderTarget, "a").unwrap();
        let id = a.id();
        pool.release(a);
        let b = pool.acquire(64, 32, UsageClass::RenderTarget, "b").unwrap();
        assert_eq!(b.id(), id);
        let stats = pool.stats();
        assert_eq!((stats.hits, stats.misses, stats.created), (1, 1, 1));
    }

    #[test]
    fn test_fifo_within_bucket() {
        let mut pool = pool();
        let a = pool.acquire(8, 8, UsageClass::Source, "a").unwrap();
        let b = pool.acquire(8, 8, UsageClass::Source, "b").unwrap();
        let (ia, ib) = (a.id(), b.id());
        pool.release(a);
        pool.release(b);
        assert_eq!(pool.acquire(8, 8, UsageClass::Source, "x").unwrap().id(), ia);
        assert_eq!(pool.acquire(8, 8, UsageClass::Source, "y").unwrap().id(), ib);
    }

    #[test]
    fn test_no_cross_bucket_reuse() {
        let mut pool = pool();
        let big = pool.acquire(2560, 1707, UsageClass::RenderTarget, "big").unwrap();
        let big_id = big.id();
        pool.release(big);

        let small = pool.acquire(1280, 853, UsageClass::RenderTarget, "small").unwrap();
        assert_ne!(small.id(), big_id);
        assert_eq!((small.width(), small.height()), (1280, 853));

        let source = pool.acquire(2560, 1707, UsageClass::Source, "src").unwrap();
        assert_ne!(source.id(), big_id);
        assert_eq!(pool.stats().created, 3);
    }

    #[test]
    fn test_never_lent_twice() {
        let mut pool = pool();
        let a = pool.acquire(4, 4, UsageClass::Source, "a").unwrap();
        let b = pool.acquire(4, 4, UsageClass::Source, "b").unwrap();
        assert_ne!(a.id(), b.id());
        assert_eq!(pool.stats().in_use, 2);
    }

    #[test]
    fn test_foreign_release_ignored() {
        let mut first = pool();
        let mut second = pool();
        let texture = first.acquire(4, 4, UsageClass::Source, "t").unwrap();
        second.release(texture);
        assert_eq!(second.stats().free, 0);
        assert_eq!(first.stats().in_use, 1);
    }

    #[test]
    fn test_clear_destroys_everything() {
        let mut pool = pool();
        let lent = pool.acquire(4, 4, UsageClass::Source, "lent").unwrap();
        let free = pool.acquire(4, 4, UsageClass::RenderTarget, "free").unwrap();
        pool.release(free);
        assert_eq!(pool.memory_bytes(), 2 * 4 * 4 * 4);

        pool.clear();
        let stats = pool.stats();
        assert_eq!((stats.free, stats.in_use), (0, 0));
        assert_eq!(pool.memory_bytes(), 0);

        // Returning a texture lent before the clear is a no-op.
        pool.release(lent);
        assert_eq!(pool.stats().free, 0);
    }
}
