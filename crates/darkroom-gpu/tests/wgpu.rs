//! Hardware smoke tests. Skipped when no adapter is present.

#![cfg(feature = "wgpu")]

use std::sync::Arc;

use darkroom_core::{Adjustments, EditParameters, PixelBuffer, PixelFormat, Quality, ToneCurveLut};
use darkroom_gpu::{Backend, DeviceConfig, EditPipeline, GpuPrimitives, PipelineConfig, WgpuPrimitives};

fn open() -> Option<EditPipeline<WgpuPrimitives>> {
    let config = DeviceConfig::from_env();
    if config.resolved_backend() != Backend::Wgpu {
        eprintln!("wgpu backend not selected or no adapter, skipping");
        return None;
    }
    let device = WgpuPrimitives::open(&config).ok()?;
    println!("adapter: {}", device.name());
    EditPipeline::init(Arc::new(device), PipelineConfig::default()).ok()
}

#[test]
fn test_downsample_block_mean() {
    let Some(mut pipeline) = open() else { return };
    #[rustfmt::skip]
    let data = vec![
        100, 50, 25,    200, 100, 75,
        50, 150, 125,   150, 100, 175,
    ];
    let image = PixelBuffer::new(data, 2, 2, PixelFormat::Rgb).unwrap();
    let params = EditParameters::new().with_scale(0.5).with_quality(Quality::Draft);
    let result = pipeline.process(&image, &params).unwrap();
    assert_eq!(result.pixels.as_bytes(), &[125, 100, 100]);
}

#[test]
fn test_gray_histogram() {
    let Some(mut pipeline) = open() else { return };
    let image = PixelBuffer::filled(64, 64, PixelFormat::Rgba, [128, 128, 128, 255]).unwrap();
    let result = pipeline.export(&image, &EditParameters::new()).unwrap();
    let histogram = result.histogram.unwrap();
    for channel in histogram.channels() {
        assert_eq!(channel[128], 4096);
    }
}

#[test]
fn test_fused_render_runs() {
    let Some(mut pipeline) = open() else { return };
    let image = PixelBuffer::filled(33, 17, PixelFormat::Rgba, [90, 120, 150, 255]).unwrap();
    let params = EditParameters::new()
        .with_rotation(30.0)
        .with_adjustments(Adjustments {
            exposure: 0.5,
            ..Default::default()
        })
        .with_tone_curve(ToneCurveLut::from_fn(|v| 255 - v));
    let result = pipeline.process(&image, &params).unwrap();
    assert!(result.variant.is_some());
    assert!(result.timing.sum_of_stages() >= 0.99 * result.timing.total());
    pipeline.destroy();
}
