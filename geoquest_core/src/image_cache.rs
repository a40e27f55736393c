//! Image encoding for the oracle, with a TTL cache in front.
//!
//! Repeated oracle attempts within one matching session (retries, several
//! candidates sharing a reference) would otherwise re-encode the same
//! photograph each time.

use crate::oracle::{ImagePayload, OracleError};
use async_trait::async_trait;
use geoquest_env::GeoQuestContext;
use image::codecs::jpeg::JpegEncoder;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::debug;

pub const JPEG_MIME: &str = "image/jpeg";

/// Turns an image reference into the oracle's transport form.
#[async_trait]
pub trait ImageCodec: Send + Sync {
    async fn encode(&self, source: &str) -> Result<ImagePayload, OracleError>;
}

fn is_remote(source: &str) -> bool {
    source.starts_with("http://") || source.starts_with("https://")
}

// ============================================================================
// JPEG CODEC
// ============================================================================

/// Reference codec: remote URLs pass through, local files are downsized to
/// fit `max_dimension` and re-encoded as JPEG.
#[derive(Debug, Clone)]
pub struct JpegImageCodec {
    pub max_dimension: u32,
    pub quality: u8,
}

impl Default for JpegImageCodec {
    fn default() -> Self {
        Self {
            max_dimension: 512,
            quality: 70,
        }
    }
}

impl JpegImageCodec {
    /// Encodes an in-memory image (e.g. a fresh camera capture).
    pub fn encode_bytes(&self, bytes: &[u8]) -> Result<ImagePayload, OracleError> {
        let decoded = image::load_from_memory(bytes)
            .map_err(|e| OracleError::Encoding(format!("decode failed: {}", e)))?;

        let max = self.max_dimension;
        let fitted = if decoded.width() > max || decoded.height() > max {
            // Preserves aspect ratio
            decoded.thumbnail(max, max)
        } else {
            decoded
        };

        // JPEG carries no alpha channel
        let rgb = fitted.to_rgb8();
        let mut out = Vec::new();
        JpegEncoder::new_with_quality(&mut out, self.quality)
            .encode_image(&rgb)
            .map_err(|e| OracleError::Encoding(format!("jpeg encode failed: {}", e)))?;

        Ok(ImagePayload::inline(out, JPEG_MIME))
    }
}

#[async_trait]
impl ImageCodec for JpegImageCodec {
    async fn encode(&self, source: &str) -> Result<ImagePayload, OracleError> {
        if is_remote(source) {
            return Ok(ImagePayload::remote(source));
        }

        let bytes = tokio::fs::read(source)
            .await
            .map_err(|e| OracleError::Encoding(format!("cannot read {}: {}", source, e)))?;

        let codec = self.clone();
        tokio::task::spawn_blocking(move || codec.encode_bytes(&bytes))
            .await
            .map_err(|e| OracleError::Encoding(format!("encoder task failed: {}", e)))?
    }
}

// ============================================================================
// CACHE
// ============================================================================

struct CacheEntry {
    payload: ImagePayload,
    cached_at: Duration,
}

fn evict_expired(entries: &mut HashMap<String, CacheEntry>, now: Duration, ttl: Duration) -> usize {
    let before = entries.len();
    entries.retain(|_, entry| now.saturating_sub(entry.cached_at) < ttl);
    before - entries.len()
}

/// Shared TTL cache of encoded images keyed by source URI.
///
/// Entries may vanish at any time; a miss simply re-encodes.
pub struct ImageCache<Ctx: GeoQuestContext> {
    ctx: Arc<Ctx>,
    codec: Arc<dyn ImageCodec>,
    ttl: Duration,
    entries: Mutex<HashMap<String, CacheEntry>>,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl<Ctx: GeoQuestContext> ImageCache<Ctx> {
    pub fn new(ctx: Arc<Ctx>, codec: Arc<dyn ImageCodec>, ttl: Duration) -> Self {
        Self {
            ctx,
            codec,
            ttl,
            entries: Mutex::new(HashMap::new()),
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub fn shared(ctx: Arc<Ctx>, codec: Arc<dyn ImageCodec>, ttl: Duration) -> Arc<Self> {
        Arc::new(Self::new(ctx, codec, ttl))
    }

    fn entries(&self) -> MutexGuard<'_, HashMap<String, CacheEntry>> {
        self.entries.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Returns the cached payload for `source`, encoding it on a miss.
    pub async fn get_or_encode(&self, source: &str) -> Result<ImagePayload, OracleError> {
        if let Some(payload) = self.lookup(source) {
            self.hits.fetch_add(1, Ordering::Relaxed);
            return Ok(payload);
        }
        self.misses.fetch_add(1, Ordering::Relaxed);

        // Not holding the lock while encoding; two concurrent misses may both
        // encode, and the later insert wins.
        let payload = self.codec.encode(source).await?;
        debug!(source, bytes = payload.size_bytes(), "image encoded");

        let now = self.ctx.now();
        let mut entries = self.entries();
        // Sources are mostly unique, so expiry cannot wait for a repeat lookup
        let evicted = evict_expired(&mut entries, now, self.ttl);
        if evicted > 0 {
            debug!(evicted, "expired images evicted");
        }
        entries.insert(
            source.to_string(),
            CacheEntry {
                payload: payload.clone(),
                cached_at: now,
            },
        );
        Ok(payload)
    }

    fn lookup(&self, source: &str) -> Option<ImagePayload> {
        let now = self.ctx.now();
        let mut entries = self.entries();
        let entry = entries.get(source)?;
        if now.saturating_sub(entry.cached_at) < self.ttl {
            return Some(entry.payload.clone());
        }
        entries.remove(source);
        None
    }

    /// Drops every expired entry. Returns how many were removed.
    pub fn purge_expired(&self) -> usize {
        evict_expired(&mut self.entries(), self.ctx.now(), self.ttl)
    }

    pub fn clear(&self) {
        self.entries().clear();
    }

    pub fn len(&self) -> usize {
        self.entries().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// (hits, misses) since creation
    pub fn stats(&self) -> (u64, u64) {
        (self.hits.load(Ordering::Relaxed), self.misses.load(Ordering::Relaxed))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::ManualContext;
    use image::{DynamicImage, GenericImageView, ImageFormat, RgbImage};
    use std::io::Cursor;
    use std::sync::atomic::AtomicUsize;

    struct CountingCodec {
        calls: AtomicUsize,
    }

    #[async_trait]
    impl ImageCodec for CountingCodec {
        async fn encode(&self, source: &str) -> Result<ImagePayload, OracleError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(ImagePayload::inline(source.as_bytes().to_vec(), JPEG_MIME))
        }
    }

    fn png_bytes(width: u32, height: u32) -> Vec<u8> {
        let img = DynamicImage::ImageRgb8(RgbImage::from_pixel(width, height, image::Rgb([200, 90, 30])));
        let mut out = Cursor::new(Vec::new());
        img.write_to(&mut out, ImageFormat::Png).unwrap();
        out.into_inner()
    }

    #[test]
    fn test_jpeg_codec_downsizes_preserving_aspect() {
        let codec = JpegImageCodec::default();
        let payload = codec.encode_bytes(&png_bytes(1024, 768)).unwrap();

        let ImagePayload::Inline { data, mime_type } = payload else {
            panic!("expected inline payload");
        };
        assert_eq!(mime_type, JPEG_MIME);

        let decoded = image::load_from_memory(&data).unwrap();
        assert_eq!(decoded.dimensions(), (512, 384));
    }

    #[test]
    fn test_jpeg_codec_keeps_small_images() {
        let codec = JpegImageCodec::default();
        let ImagePayload::Inline { data, .. } = codec.encode_bytes(&png_bytes(200, 100)).unwrap() else {
            panic!("expected inline payload");
        };
        assert_eq!(image::load_from_memory(&data).unwrap().dimensions(), (200, 100));
    }

    #[test]
    fn test_jpeg_codec_rejects_garbage() {
        let err = JpegImageCodec::default().encode_bytes(b"not an image").unwrap_err();
        assert!(matches!(err, OracleError::Encoding(_)));
    }

    #[tokio::test]
    async fn test_remote_sources_pass_through() {
        let payload = JpegImageCodec::default().encode("https://cdn.example/q.jpg").await.unwrap();
        assert_eq!(payload, ImagePayload::remote("https://cdn.example/q.jpg"));
    }

    #[tokio::test]
    async fn test_missing_local_file_is_encoding_error() {
        let err = JpegImageCodec::default()
            .encode("/definitely/not/here.jpg")
            .await
            .unwrap_err();
        assert!(matches!(err, OracleError::Encoding(_)));
    }

    #[tokio::test]
    async fn test_cache_hits_within_ttl_and_expires_after() {
        let ctx = ManualContext::shared();
        let codec = Arc::new(CountingCodec { calls: AtomicUsize::new(0) });
        let cache = ImageCache::new(ctx.clone(), codec.clone(), Duration::from_secs(60));

        cache.get_or_encode("file://a").await.unwrap();
        ctx.advance(Duration::from_secs(30));
        cache.get_or_encode("file://a").await.unwrap();
        assert_eq!(codec.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.stats(), (1, 1));

        ctx.advance(Duration::from_secs(31));
        cache.get_or_encode("file://a").await.unwrap();
        assert_eq!(codec.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_purge_expired() {
        let ctx = ManualContext::shared();
        let codec = Arc::new(CountingCodec { calls: AtomicUsize::new(0) });
        let cache = ImageCache::new(ctx.clone(), codec, Duration::from_secs(60));

        cache.get_or_encode("old").await.unwrap();
        ctx.advance(Duration::from_secs(45));
        cache.get_or_encode("new").await.unwrap();
        ctx.advance(Duration::from_secs(20));

        assert_eq!(cache.purge_expired(), 1);
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_unique_sources_stay_bounded_by_ttl() {
        let ctx = ManualContext::shared();
        let codec = Arc::new(CountingCodec { calls: AtomicUsize::new(0) });
        let cache = ImageCache::new(ctx.clone(), codec, Duration::from_secs(300));

        for i in 0..1000 {
            cache.get_or_encode(&format!("file:///photos/{}.jpg", i)).await.unwrap();
            ctx.advance(Duration::from_secs(60));
        }

        // One photo per minute with a five minute TTL
        assert!(cache.len() <= 5, "cache holds {} entries", cache.len());
        assert_eq!(cache.stats(), (0, 1000));
    }
}
