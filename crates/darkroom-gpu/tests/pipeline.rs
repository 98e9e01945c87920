//! End-to-end renders on the in-memory backend.

use std::sync::Arc;

use approx::assert_relative_eq;
use darkroom_core::{
    Adjustments, EditParameters, Mask, MaskGeometry, PixelBuffer, PixelFormat, Quality, Stage, ToneCurveLut,
};
use darkroom_gpu::{
    Backend, CapabilityService, CpuPrimitives, DeviceConfig, DownsampleMode, EditPipeline, GpuError, PipelineConfig,
    PipelineVariant,
};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

fn pipeline_with(config: PipelineConfig) -> (Arc<CpuPrimitives>, EditPipeline<CpuPrimitives>) {
    init_tracing();
    let device = Arc::new(CpuPrimitives::new());
    let pipeline = EditPipeline::init(device.clone(), config).unwrap();
    (device, pipeline)
}

fn photo(width: u32, height: u32) -> PixelBuffer {
    let mut data = Vec::with_capacity((width * height * 4) as usize);
    for y in 0..height {
        for x in 0..width {
            let r = (x * 255 / width.max(1)) as u8;
            let g = (y * 255 / height.max(1)) as u8;
            data.extend_from_slice(&[r, g, r / 2 + g / 2, 255]);
        }
    }
    PixelBuffer::new(data, width, height, PixelFormat::Rgba).unwrap()
}

fn everything() -> EditParameters {
    EditParameters::new()
        .with_rotation(12.0)
        .with_adjustments(Adjustments {
            exposure: 0.4,
            contrast: 10.0,
            ..Default::default()
        })
        .with_tone_curve(ToneCurveLut::from_fn(|v| v.saturating_add(8)))
        .with_mask(Mask::new(
            MaskGeometry::Radial {
                center: [0.5, 0.5],
                radius: [0.3, 0.3],
                feather: 0.5,
            },
            Adjustments {
                saturation: -50.0,
                ..Default::default()
            },
        ))
}

#[test]
fn test_timing_map_complete() {
    let (_, mut pipeline) = pipeline_with(PipelineConfig::default());
    for params in [EditParameters::new(), everything(), everything().with_scale(0.5)] {
        let result = pipeline.process(&photo(40, 30), &params).unwrap();
        let map = result.timing.as_map();
        for key in [
            "downsample",
            "upload",
            "rotation",
            "adjustments",
            "toneCurve",
            "masks",
            "analysis",
            "readback",
            "total",
        ] {
            assert!(map.contains_key(key), "missing {key}");
        }
        let timing = &result.timing;
        assert!(timing.total() > 0.0);
        assert!(timing.sum_of_stages() >= 0.99 * timing.total(), "{timing}");
        assert_relative_eq!(timing.sum_of_stages(), timing.total(), max_relative = 0.01);
    }
}

#[test]
fn test_skipped_stages_read_zero() {
    let (_, mut pipeline) = pipeline_with(PipelineConfig::default());
    let result = pipeline.process(&photo(24, 16), &EditParameters::new()).unwrap();
    for stage in [Stage::Downsample, Stage::Rotation, Stage::Adjustments, Stage::ToneCurve, Stage::Masks] {
        assert_eq!(result.timing.get(stage), 0.0, "{stage}");
    }
    assert!(result.timing.get(Stage::Upload) > 0.0);
    assert!(result.timing.get(Stage::Readback) > 0.0);
}

fn spot(invert: bool) -> EditParameters {
    let mut mask = Mask::new(
        MaskGeometry::Radial {
            center: [0.25, 0.25],
            radius: [0.2, 0.2],
            feather: 0.0,
        },
        Adjustments {
            exposure: 2.0,
            ..Default::default()
        },
    );
    mask.invert = invert;
    EditParameters::new().with_mask(mask)
}

/// Distance from the spot center in radii, at the pixel center.
fn spot_distance(x: u32, y: u32, size: u32) -> f32 {
    let p = [(x as f32 + 0.5) / size as f32, (y as f32 + 0.5) / size as f32];
    let d = [(p[0] - 0.25) / 0.2, (p[1] - 0.25) / 0.2];
    (d[0] * d[0] + d[1] * d[1]).sqrt()
}

#[test]
fn test_mask_leaves_zero_weight_pixels_untouched() {
    let (_, mut pipeline) = pipeline_with(PipelineConfig::default());
    let size = 32;
    let data: Vec<u8> = (0..size * size)
        .flat_map(|i| [20 + (i % size) as u8, 30 + (i / size) as u8, 50, 255])
        .collect();
    let image = PixelBuffer::new(data, size, size, PixelFormat::Rgba).unwrap();

    for invert in [false, true] {
        let result = pipeline.process(&image, &spot(invert)).unwrap();
        let (src, out) = (image.as_bytes(), result.pixels.as_bytes());
        let (mut inside, mut outside) = (0, 0);
        for y in 0..size {
            for x in 0..size {
                let r = spot_distance(x, y, size);
                if (0.95..1.05).contains(&r) {
                    continue;
                }
                let i = ((y * size + x) * 4) as usize;
                let affected = (r < 1.0) != invert;
                if affected {
                    assert!(out[i..i + 3].iter().zip(&src[i..i + 3]).all(|(o, s)| o > s), "({x}, {y}) not brightened");
                    inside += 1;
                } else {
                    assert_eq!(&out[i..i + 4], &src[i..i + 4], "({x}, {y}) changed, invert={invert}");
                    outside += 1;
                }
            }
        }
        assert!(inside > 0 && outside > 0);
    }
}

#[test]
fn test_dispatch_order() {
    let (_, mut pipeline) = pipeline_with(PipelineConfig::default());
    let result = pipeline.process(&photo(64, 48), &everything().with_scale(0.5)).unwrap();
    let labels: Vec<_> = result.gpu_timings.as_ref().unwrap().iter().map(|(label, _)| label).collect();
    assert_eq!(
        labels,
        vec!["downsample", "rotation", "uber_combined_f16", "masks", "histogram"]
    );
}

#[test]
fn test_identity_render_returns_input() {
    let (_, mut pipeline) = pipeline_with(PipelineConfig::default());
    let image = photo(13, 7);
    let params = EditParameters::new()
        .with_rotation(360.0)
        .with_adjustments(Adjustments::default())
        .with_tone_curve(ToneCurveLut::identity());
    let result = pipeline.process(&image, &params).unwrap();
    assert_eq!(result.pixels, image);
    assert_eq!(result.variant, None);
}

#[test]
fn test_rgb_round_trip_keeps_format() {
    let (_, mut pipeline) = pipeline_with(PipelineConfig::default());
    let image = PixelBuffer::filled(6, 4, PixelFormat::Rgb, [40, 80, 120, 255]).unwrap();
    let params = EditParameters::new().with_tone_curve(ToneCurveLut::from_fn(|v| 255 - v));
    let result = pipeline.process(&image, &params).unwrap();
    assert_eq!(result.pixels.format(), PixelFormat::Rgb);
    assert_eq!(result.pixels.pixel(0, 0), Some([215, 175, 135, 255]));
}

#[test]
fn test_rotation_changes_dimensions() {
    let (_, mut pipeline) = pipeline_with(PipelineConfig::default());
    let result = pipeline.process(&photo(30, 10), &EditParameters::new().with_rotation(90.0)).unwrap();
    assert_eq!((result.pixels.width(), result.pixels.height()), (10, 30));
}

#[test]
fn test_cpu_and_gpu_downsample_agree() {
    let params = everything().with_scale(0.5).with_quality(Quality::Draft);
    let image = photo(50, 34);
    let (_, mut gpu) = pipeline_with(PipelineConfig::default());
    let (_, mut cpu) = pipeline_with(PipelineConfig::builder().downsample_mode(DownsampleMode::Cpu).build());
    let a = gpu.process(&image, &params).unwrap();
    let b = cpu.process(&image, &params).unwrap();
    assert_eq!(a.pixels, b.pixels);
    assert_eq!((a.pixels.width(), a.pixels.height()), (b.pixels.width(), b.pixels.height()));
}

#[test]
fn test_full_render_reports_histogram() {
    let (_, mut pipeline) = pipeline_with(PipelineConfig::builder().staging_pool_size(1).build());
    let image = photo(32, 32);
    let result = pipeline.process(&image, &everything()).unwrap();
    let histogram = result.histogram.expect("full render carries a histogram");
    let (w, h) = (result.pixels.width() as u64, result.pixels.height() as u64);
    assert_eq!(histogram.pixel_count(), Some(w * h));
    assert!(result.clipping.is_some());
    assert!(!result.histogram_stale);

    let draft = pipeline.process(&image, &everything().with_quality(Quality::Draft)).unwrap();
    assert!(draft.histogram.is_none());
    assert_relative_eq!(draft.timing.get(Stage::Analysis), 0.0, epsilon = 0.05);
}

#[test]
fn test_undelivered_histogram_marked_stale() {
    let (device, mut pipeline) = pipeline_with(PipelineConfig::default());
    let gray = PixelBuffer::filled(16, 16, PixelFormat::Rgba, [128, 128, 128, 255]).unwrap();
    let white = PixelBuffer::filled(16, 16, PixelFormat::Rgba, [255, 255, 255, 255]).unwrap();

    let first = pipeline.process(&gray, &EditParameters::new()).unwrap();
    assert!(!first.histogram_stale);
    assert_eq!(first.histogram.as_ref().unwrap().luminance[128], 256);

    // This render's readback never lands, so the gray result is reported as stale.
    device.fail_next_maps(1);
    let second = pipeline.process(&white, &EditParameters::new()).unwrap();
    assert!(second.histogram_stale);
    assert_eq!(second.histogram, first.histogram);
}

#[test]
fn test_export_uses_full_resolution_and_sync_histogram() {
    let (_, mut pipeline) = pipeline_with(PipelineConfig::default());
    let image = photo(20, 20);
    let params = EditParameters::new()
        .with_scale(0.25)
        .with_quality(Quality::Draft)
        .with_tone_curve(ToneCurveLut::from_fn(|v| v / 2));
    let result = pipeline.export(&image, &params).unwrap();
    assert_eq!((result.pixels.width(), result.pixels.height()), (20, 20));
    assert_eq!(result.quality, Quality::Full);
    assert_eq!(result.histogram.unwrap().pixel_count(), Some(400));
    assert_eq!(pipeline.stats().staging.completed, 0);
}

#[test]
fn test_variant_cache_survives_across_renders() {
    let (_, mut pipeline) = pipeline_with(PipelineConfig::builder().half_precision(false).analysis(false).build());
    let image = photo(16, 16);
    let adjust_only = EditParameters::new().with_adjustments(Adjustments {
        exposure: 1.0,
        ..Default::default()
    });
    let combined = adjust_only.clone().with_tone_curve(ToneCurveLut::from_fn(|v| v / 2));

    pipeline.process(&image, &adjust_only).unwrap();
    let result = pipeline.process(&image, &combined).unwrap();
    assert_eq!(result.variant, Some(PipelineVariant::Combined));
    let compiles = pipeline.stats().compiles;

    pipeline.process(&image, &adjust_only).unwrap();
    pipeline.process(&image, &combined).unwrap();
    assert_eq!(pipeline.stats().compiles, compiles);
}

#[test]
fn test_device_loss_is_sticky() {
    let (device, mut pipeline) = pipeline_with(PipelineConfig::default());
    let image = photo(8, 8);
    pipeline.process(&image, &EditParameters::new()).unwrap();

    device.lose_device();
    let err = pipeline.process(&image, &EditParameters::new()).unwrap_err();
    assert!(err.is_device_lost(), "{err}");
    assert!(pipeline.is_lost());
    assert!(matches!(
        pipeline.process(&image, &EditParameters::new()),
        Err(GpuError::DeviceLost(_))
    ));
}

#[test]
fn test_invalid_parameters_rejected() {
    let (_, mut pipeline) = pipeline_with(PipelineConfig::default());
    let params = EditParameters::new().with_scale(0.0);
    assert!(matches!(
        pipeline.process(&photo(4, 4), &params),
        Err(GpuError::Core(_))
    ));
    assert!(!pipeline.is_lost());
}

#[test]
fn test_unavailable_device_falls_back() {
    let service: CapabilityService<CpuPrimitives> =
        CapabilityService::new(|| Err(GpuError::Unavailable("no adapter".into())));
    assert!(!service.probe().available);
    assert!(matches!(service.device(), Err(GpuError::Unavailable(_))));

    let working = CapabilityService::new(|| Ok(CpuPrimitives::new()));
    let mut pipeline = EditPipeline::init(working.device().unwrap(), PipelineConfig::default()).unwrap();
    assert!(pipeline.capabilities().available);
    pipeline.destroy();
    assert!(pipeline.is_destroyed());
}

#[test]
fn test_device_config_limits_features() {
    let env = [
        ("DARKROOM_BACKEND", "cpu"),
        ("DARKROOM_DISABLE_F16", "1"),
        ("DARKROOM_DISABLE_TIMING", "true"),
    ];
    let config = DeviceConfig::from_lookup(|key| env.iter().find(|(k, _)| *k == key).map(|(_, v)| v.to_string()));
    assert_eq!(config.resolved_backend(), Backend::Cpu);

    let device = Arc::new(CpuPrimitives::open(&config));
    let mut pipeline = EditPipeline::init(device, PipelineConfig::default()).unwrap();
    let features = pipeline.capabilities().features;
    assert!(!features.half_precision && !features.timestamp_query && features.subgroups);

    let result = pipeline.process(&photo(16, 16), &everything()).unwrap();
    assert_eq!(result.variant, Some(PipelineVariant::Combined));
    assert!(result.gpu_timings.is_none());
}
