//! Thin layer binding wire order callbacks (`CacheBitmap`, `CacheBitmapV2`,
//! `CacheBitmapV3`, `MemBlt`, `Mem3Blt`) to the bitmap cache and a
//! downstream rendering callback.
//!
//! Per design note 9, the original pointer-graph callback swap is
//! expressed here as trait objects registered at construction rather than
//! function pointers overwritten in place.

use std::collections::HashMap;

use log::debug;

use rdp_vendor::{BitmapCodec, CodecId, InterleavedRle8Codec, RawCodec};

use crate::bitmap_cache::{Bitmap, BitmapCache};
use crate::errors::RdpError;

/// `cacheId == 0xFF` on a MEMBLT means the source is the offscreen
/// surface cache, an external collaborator (spec §4.4).
pub const OFFSCREEN_CACHE_ID: usize = 0xFF;

/// Flag on a MEM3BLT brush selecting the brush cache instead of an
/// inline pattern.
pub const CACHED_BRUSH_FLAG: u8 = 0x01;

/// Style value MEM3BLT temporarily installs for the duration of a cached
/// brush draw, then restores (spec §4.4).
const CACHED_BRUSH_STYLE: u8 = 0x03;

#[derive(Debug, Clone, Copy)]
pub struct Rect {
    pub left: u16,
    pub top: u16,
    pub width: u16,
    pub height: u16,
}

#[derive(Debug, Clone)]
pub struct CacheBitmapV1Order {
    pub cache_id: usize,
    pub cache_index: u16,
    pub bpp: u8,
    pub width: u16,
    pub height: u16,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CacheBitmapV2Order {
    pub cache_id: usize,
    pub cache_index: u16,
    pub bpp: u8,
    pub width: u16,
    pub height: u16,
    pub compressed: bool,
    pub key1: u32,
    pub key2: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone)]
pub struct CacheBitmapV3Order {
    pub cache_id: usize,
    pub cache_index: u16,
    pub bpp: u8,
    pub width: u16,
    pub height: u16,
    pub codec_id: u8,
    pub key1: u32,
    pub key2: u32,
    pub data: Vec<u8>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Brush {
    pub flags: u8,
    pub cache_index: u16,
    pub style: u8,
}

#[derive(Debug, Clone)]
pub struct MemBltOrder {
    pub cache_id: usize,
    pub cache_index: u16,
    pub dest: Rect,
    /// Resolved brush to paint with, if any. `None` for a plain MEMBLT;
    /// `Some` when this order was built by `on_mem3_blt` after resolving
    /// (and possibly overriding) the MEM3BLT's brush.
    pub brush: Option<Brush>,
}

#[derive(Debug, Clone)]
pub struct Mem3BltOrder {
    pub cache_id: usize,
    pub cache_index: u16,
    pub dest: Rect,
    pub brush: Brush,
}

fn combine_key(key1: u32, key2: u32) -> u64 {
    key1 as u64 | ((key2 as u64) << 32)
}

/// Downstream rendering callback invoked once a bitmap has been resolved.
pub trait OrderRenderer: Send + Sync {
    fn draw_bitmap(&self, dest: Rect, bitmap: &Bitmap, brush: Option<Brush>);
}

/// External collaborator for `cacheId == 0xFF` sources.
pub trait OffscreenCache: Send + Sync {
    fn get(&self, cache_index: u16) -> Option<Bitmap>;
}

/// External collaborator resolving `CACHED_BRUSH` references.
pub trait BrushCache: Send + Sync {
    fn get(&self, cache_index: u16) -> Option<Brush>;
}

pub struct OrderDispatcher {
    cache: BitmapCache,
    codecs: HashMap<CodecId, Box<dyn BitmapCodec>>,
    renderer: Box<dyn OrderRenderer>,
    offscreen: Option<Box<dyn OffscreenCache>>,
    brush_cache: Option<Box<dyn BrushCache>>,
}

impl OrderDispatcher {
    /// Registered only when client-side decoding is enabled by
    /// configuration (spec §4.5); callers that don't enable it never
    /// construct one.
    pub fn new(cache: BitmapCache, renderer: Box<dyn OrderRenderer>) -> Self {
        let mut codecs: HashMap<CodecId, Box<dyn BitmapCodec>> = HashMap::new();
        codecs.insert(CodecId::None, Box::new(RawCodec));
        codecs.insert(CodecId::InterleavedRle, Box::new(InterleavedRle8Codec));
        Self {
            cache,
            codecs,
            renderer,
            offscreen: None,
            brush_cache: None,
        }
    }

    pub fn with_offscreen_cache(mut self, offscreen: Box<dyn OffscreenCache>) -> Self {
        self.offscreen = Some(offscreen);
        self
    }

    pub fn with_brush_cache(mut self, brush_cache: Box<dyn BrushCache>) -> Self {
        self.brush_cache = Some(brush_cache);
        self
    }

    pub fn register_codec(&mut self, id: CodecId, codec: Box<dyn BitmapCodec>) {
        self.codecs.insert(id, codec);
    }

    pub fn cache(&self) -> &BitmapCache {
        &self.cache
    }

    pub fn cache_mut(&mut self) -> &mut BitmapCache {
        &mut self.cache
    }

    /// v1 orders are always decoded as "bitmap, compressed or not" with
    /// no explicit flag; the RLE codec tolerates an uncompressed payload
    /// only when it happens to decode cleanly, so v1 always goes through
    /// `RawCodec` here, matching the order's lack of a `compressed` flag.
    pub fn on_cache_bitmap_v1(&mut self, order: CacheBitmapV1Order) -> Result<(), RdpError> {
        let bpp = self.cache.normalize_bpp(order.bpp);
        let pixels = self.decode(CodecId::None, &order.data, order.width, order.height, bpp)?;
        let bitmap = Bitmap {
            width: order.width,
            height: order.height,
            bpp,
            key64: 0,
            pixels,
        };
        self.cache.put(order.cache_id, order.cache_index, bitmap)
    }

    /// v2 orders carry an explicit `compressed` flag and a 64-bit content
    /// key used as the persistent store's primary key.
    pub fn on_cache_bitmap_v2(&mut self, order: CacheBitmapV2Order) -> Result<(), RdpError> {
        let bpp = self.cache.normalize_bpp(order.bpp);
        let codec_id = if order.compressed {
            CodecId::InterleavedRle
        } else {
            CodecId::None
        };
        let pixels = self.decode(codec_id, &order.data, order.width, order.height, bpp)?;
        let bitmap = Bitmap {
            width: order.width,
            height: order.height,
            bpp,
            key64: combine_key(order.key1, order.key2),
            pixels,
        };
        self.cache.put(order.cache_id, order.cache_index, bitmap)
    }

    /// v3 orders carry an explicit `codecId`: `NONE` bypasses the codec
    /// registry entirely; anything else is dispatched to a registered
    /// plug-in.
    pub fn on_cache_bitmap_v3(&mut self, order: CacheBitmapV3Order) -> Result<(), RdpError> {
        let bpp = self.cache.normalize_bpp(order.bpp);
        let codec_id = CodecId::from_wire(order.codec_id);
        let pixels = self.decode(codec_id, &order.data, order.width, order.height, bpp)?;
        let bitmap = Bitmap {
            width: order.width,
            height: order.height,
            bpp,
            key64: combine_key(order.key1, order.key2),
            pixels,
        };
        self.cache.put(order.cache_id, order.cache_index, bitmap)
    }

    fn decode(&self, codec_id: CodecId, data: &[u8], width: u16, height: u16, bpp: u8) -> Result<Vec<u8>, RdpError> {
        let codec = self
            .codecs
            .get(&codec_id)
            .ok_or_else(|| RdpError::Other(format!("no codec registered for {codec_id:?}")))?;
        codec
            .decode(data, width, height, bpp)
            .map_err(|e| RdpError::Other(e.to_string()))
    }

    /// Binds a MEMBLT to cache contents (or the offscreen surface cache
    /// for `cacheId == 0xFF`). Missing sources are tolerated silently:
    /// the dispatcher returns success and performs no drawing (spec
    /// §4.4, Scenario 5).
    pub fn on_mem_blt(&self, order: MemBltOrder) -> Result<(), RdpError> {
        let bitmap = if order.cache_id == OFFSCREEN_CACHE_ID {
            self.offscreen.as_ref().and_then(|cache| cache.get(order.cache_index))
        } else {
            self.cache.get(order.cache_id, order.cache_index).cloned()
        };

        match bitmap {
            Some(bitmap) => {
                self.renderer.draw_bitmap(order.dest, &bitmap, order.brush);
                Ok(())
            }
            None => {
                debug!(
                    "MEMBLT referenced undefined cache entry (cell={}, idx={})",
                    order.cache_id, order.cache_index
                );
                Ok(())
            }
        }
    }

    /// MEM3BLT additionally resolves a brush: if `CACHED_BRUSH` is set,
    /// look it up via the brush cache and override `style` to `0x03` for
    /// the duration of the draw. The resolved brush is forwarded into the
    /// underlying MEMBLT so the renderer actually sees it.
    pub fn on_mem3_blt(&self, order: Mem3BltOrder) -> Result<(), RdpError> {
        let mut brush = order.brush;
        if brush.flags & CACHED_BRUSH_FLAG != 0 {
            if let Some(cached) = self.brush_cache.as_ref().and_then(|bc| bc.get(brush.cache_index)) {
                brush = cached;
            }
            brush.style = CACHED_BRUSH_STYLE;
        }

        self.on_mem_blt(MemBltOrder {
            cache_id: order.cache_id,
            cache_index: order.cache_index,
            dest: order.dest,
            brush: Some(brush),
        })
    }
}
