//! Draft/full refinement driven against a real pipeline.

use std::sync::Arc;
use std::time::{Duration, Instant};

use darkroom_core::{Adjustments, EditParameters, PixelBuffer, PixelFormat, Quality};
use darkroom_gpu::{CpuPrimitives, EditPipeline, EditSession, PipelineConfig, SessionConfig, SessionState};

fn pipeline() -> EditPipeline<CpuPrimitives> {
    EditPipeline::init(Arc::new(CpuPrimitives::new()), PipelineConfig::default()).unwrap()
}

fn source() -> PixelBuffer {
    let data: Vec<u8> = (0..64u32 * 48).flat_map(|i| [(i % 251) as u8, (i % 127) as u8, 90, 255]).collect();
    PixelBuffer::new(data, 64, 48, PixelFormat::Rgba).unwrap()
}

fn brighter(exposure: f32) -> EditParameters {
    EditParameters::new().with_adjustments(Adjustments {
        exposure,
        ..Default::default()
    })
}

#[test]
fn test_draft_then_full_render() {
    let mut pipeline = pipeline();
    let mut session = EditSession::new(SessionConfig::default());
    let image = source();
    let t0 = Instant::now();

    session.input(brighter(0.5), t0);
    let draft = session.run(&mut pipeline, &image, t0).unwrap().unwrap();
    assert_eq!(draft.quality, Quality::Draft);
    assert_eq!((draft.pixels.width(), draft.pixels.height()), (32, 24));
    assert!(draft.histogram.is_none());

    // Same generation, not drafted again.
    assert!(session.run(&mut pipeline, &image, t0 + Duration::from_millis(100)).unwrap().is_none());

    let full = session
        .run(&mut pipeline, &image, t0 + Duration::from_millis(300))
        .unwrap()
        .unwrap();
    assert_eq!(full.quality, Quality::Full);
    assert_eq!((full.pixels.width(), full.pixels.height()), (64, 48));
    assert_eq!(full.histogram.unwrap().pixel_count(), Some(64 * 48));
    assert_eq!(session.state(), SessionState::Complete);

    let stats = session.stats();
    assert_eq!((stats.drafts, stats.full_renders, stats.displayed), (1, 1, 2));
}

#[test]
fn test_full_render_superseded_by_input() {
    let mut pipeline = pipeline();
    let mut session = EditSession::default();
    let image = source();
    let t0 = Instant::now();

    session.input(brighter(0.2), t0);
    let request = session.poll(t0 + Duration::from_millis(260)).unwrap();
    assert_eq!(request.ticket.quality, Quality::Full);
    let result = pipeline.process(&image, &request.params).unwrap();

    // Input lands while the full render is in flight.
    session.input(brighter(0.9), t0 + Duration::from_millis(270));
    assert!(session.complete(request.ticket, result).is_none());
    assert_eq!(session.stats().discarded, 1);

    let draft = session
        .run(&mut pipeline, &image, t0 + Duration::from_millis(270))
        .unwrap()
        .unwrap();
    assert_eq!(draft.quality, Quality::Draft);
    assert_eq!(session.state(), SessionState::Interacting);
}

#[test]
fn test_failed_render_abandoned() {
    let device = Arc::new(CpuPrimitives::new());
    let mut pipeline = EditPipeline::init(device.clone(), PipelineConfig::default()).unwrap();
    let mut session = EditSession::default();
    let t0 = Instant::now();

    session.input(brighter(0.3), t0);
    device.lose_device();
    let err = session
        .run(&mut pipeline, &source(), t0 + Duration::from_millis(400))
        .unwrap_err();
    assert!(err.is_device_lost());
    assert_eq!(session.state(), SessionState::Idle);
}
