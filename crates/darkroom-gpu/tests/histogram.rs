//! Histogram engine: strategy agreement, sums, sync and async readback.

use std::sync::Arc;

use darkroom_core::HistogramResult;
use darkroom_gpu::backend::{CpuTexture, GpuPrimitives, TextureDesc, UsageClass};
use darkroom_gpu::passes::PassContext;
use darkroom_gpu::{CpuPrimitives, HistogramEngine, HistogramRequest, HistogramStrategy, StagingBufferPool};

fn upload(device: &CpuPrimitives, width: u32, height: u32, rgba: &[u8]) -> CpuTexture {
    let texture = device
        .create_texture(&TextureDesc {
            label: "analysis",
            width,
            height,
            usage: UsageClass::RenderTarget,
        })
        .unwrap();
    device.write_texture(&texture, rgba).unwrap();
    texture
}

fn gradient(width: u32, height: u32) -> Vec<u8> {
    let mut out = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            out.extend_from_slice(&[(x * 7 % 256) as u8, (y * 13 % 256) as u8, ((x + y) * 3 % 256) as u8, 255]);
        }
    }
    out
}

#[test]
fn test_uniform_gray_single_bin() {
    let ctx = PassContext::new(Arc::new(CpuPrimitives::new()));
    let texture = upload(ctx.device(), 64, 64, &[128u8, 128, 128, 255].repeat(64 * 64));

    for strategy in [HistogramStrategy::Standard, HistogramStrategy::Subgroup] {
        let mut engine = HistogramEngine::with_strategy(&ctx, strategy).unwrap();
        let result = engine.compute_sync(&ctx, &texture, None).unwrap();
        for channel in result.channels() {
            assert_eq!(channel[128], 4096, "{strategy:?}");
            assert_eq!(channel.iter().sum::<u32>(), 4096, "{strategy:?}");
        }
    }
}

#[test]
fn test_strategies_identical() {
    let ctx = PassContext::new(Arc::new(CpuPrimitives::new()));
    for (w, h) in [(37, 23), (256, 1), (1, 300), (100, 100)] {
        let rgba = gradient(w, h);
        let texture = upload(ctx.device(), w, h, &rgba);

        let mut standard = HistogramEngine::with_strategy(&ctx, HistogramStrategy::Standard).unwrap();
        let mut subgroup = HistogramEngine::with_strategy(&ctx, HistogramStrategy::Subgroup).unwrap();
        let a = standard.compute_sync(&ctx, &texture, None).unwrap();
        let b = subgroup.compute_sync(&ctx, &texture, None).unwrap();

        assert_eq!(a, b, "{w}x{h}");
        assert_eq!(a, HistogramResult::from_rgba(&rgba), "{w}x{h}");
    }
}

#[test]
fn test_channel_sums_equal_pixel_count() {
    let ctx = PassContext::new(Arc::new(CpuPrimitives::new()));
    let (w, h) = (61, 45);
    let texture = upload(ctx.device(), w, h, &gradient(w, h));
    let mut engine = HistogramEngine::new(&ctx, true).unwrap();
    let result = engine.compute_sync(&ctx, &texture, None).unwrap();
    assert_eq!(result.totals(), [(w * h) as u64; 4]);
    assert_eq!(result.pixel_count(), Some((w * h) as u64));
}

#[test]
fn test_async_stale_when_staging_exhausted() {
    let device = Arc::new(CpuPrimitives::new());
    let ctx = PassContext::new(device.clone());
    let mut staging = StagingBufferPool::with_capacity(device.clone(), 1, 4096).unwrap();
    let mut engine = HistogramEngine::new(&ctx, false).unwrap();

    let dark = upload(&device, 8, 8, &[0u8, 0, 0, 255].repeat(64));
    let bright = upload(&device, 8, 8, &[255u8, 255, 255, 255].repeat(64));

    let first = engine.request_async(&ctx, &mut staging, &dark, None).unwrap();
    assert!(first.is_scheduled());

    // Nothing delivered yet: stale, and empty rather than zeroed.
    let dispatches = ctx.stats().dispatches();
    match engine.request_async(&ctx, &mut staging, &bright, None).unwrap() {
        HistogramRequest::Stale(previous) => assert!(previous.is_none()),
        other => panic!("expected stale, got {other:?}"),
    }
    assert_eq!(ctx.stats().dispatches(), dispatches);

    staging.pump().unwrap();
    let delivered = engine.latest().unwrap();
    assert_eq!(delivered.luminance[0], 64);

    assert!(engine.request_async(&ctx, &mut staging, &bright, None).unwrap().is_scheduled());
    match engine.request_async(&ctx, &mut staging, &bright, None).unwrap() {
        HistogramRequest::Stale(previous) => assert_eq!(previous, Some(delivered)),
        other => panic!("expected stale, got {other:?}"),
    }

    staging.wait_idle().unwrap();
    assert_eq!(engine.latest().unwrap().luminance[255], 64);
}

#[test]
fn test_latest_since_tracks_request_seq() {
    let device = Arc::new(CpuPrimitives::new());
    let ctx = PassContext::new(device.clone());
    let mut staging = StagingBufferPool::with_capacity(device.clone(), 2, 4096).unwrap();
    let mut engine = HistogramEngine::new(&ctx, false).unwrap();
    let black = upload(&device, 4, 4, &[0u8, 0, 0, 255].repeat(16));

    let HistogramRequest::Scheduled { seq, .. } = engine.request_async(&ctx, &mut staging, &black, None).unwrap()
    else {
        panic!("expected a scheduled readback");
    };
    assert_eq!(engine.latest_since(seq), (None, true));

    staging.pump().unwrap();
    let (latest, stale) = engine.latest_since(seq);
    assert!(!stale);
    assert_eq!(latest.unwrap().luminance[0], 16);
}

#[test]
fn test_async_failed_map_keeps_previous() {
    let device = Arc::new(CpuPrimitives::new());
    let ctx = PassContext::new(device.clone());
    let mut staging = StagingBufferPool::with_capacity(device.clone(), 1, 4096).unwrap();
    let mut engine = HistogramEngine::new(&ctx, true).unwrap();
    let gray = upload(&device, 4, 4, &[128u8, 128, 128, 255].repeat(16));
    let white = upload(&device, 4, 4, &[255u8; 64]);

    engine.request_async(&ctx, &mut staging, &gray, None).unwrap();
    staging.wait_idle().unwrap();
    let before = engine.latest().unwrap();

    device.fail_next_maps(1);
    engine.request_async(&ctx, &mut staging, &white, None).unwrap();
    staging.wait_idle().unwrap();
    assert_eq!(engine.latest(), Some(before));
    assert_eq!(staging.stats().failed, 1);
}
