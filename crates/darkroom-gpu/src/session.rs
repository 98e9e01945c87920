//! Interactive draft/full refinement loop.
//!
//! ```text
//!            input                 quiet period            full done
//! Idle ───────────────> Interacting ───────────> Refining ──────────> Complete
//!  ^                      ^  │ drafts (throttled)   │ input               │
//!  │                      │  └──────────────────────┘                     │
//!  └──────────────────────┴───────────────────── next poll ───────────────┘
//! ```
//!
//! The session never touches the GPU itself; it decides what to render and
//! whether a finished render is still worth displaying. Time is passed in
//! by the caller so tests can drive it deterministically.
//!
//! A full render superseded by newer input is not aborted. Its result is
//! discarded by [`EditSession::complete`] when it arrives.

use std::time::Instant;

use darkroom_core::{EditParameters, PixelBuffer, Quality};
use tracing::{debug, trace};

use crate::backend::GpuPrimitives;
use crate::config::SessionConfig;
use crate::pipeline::{EditPipeline, PipelineResult};
use crate::GpuResult;

/// Where the session is in the refinement loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SessionState {
    /// Nothing to render.
    #[default]
    Idle,
    /// Input arriving; drafts are rendered at a throttled rate.
    Interacting,
    /// Input settled; a full render is in flight.
    Refining,
    /// The full render was displayed.
    Complete,
}

/// Identifies one issued render.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RenderTicket {
    /// Input generation the render was issued for.
    pub generation: u64,
    /// Issue order across all renders of the session.
    pub seq: u64,
    /// Draft or full.
    pub quality: Quality,
}

/// A render the caller should run.
#[derive(Debug, Clone)]
pub struct RenderRequest {
    /// Hand back to [`EditSession::complete`] with the result.
    pub ticket: RenderTicket,
    /// Parameters with quality and scale already set.
    pub params: EditParameters,
}

/// Session counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionStats {
    /// Draft renders issued.
    pub drafts: u64,
    /// Full renders issued.
    pub full_renders: u64,
    /// Results passed on for display.
    pub displayed: u64,
    /// Results dropped as superseded.
    pub discarded: u64,
}

/// Draft/full render scheduler for one editing session.
#[derive(Debug)]
pub struct EditSession {
    config: SessionConfig,
    state: SessionState,
    params: EditParameters,
    generation: u64,
    last_input: Option<Instant>,
    last_draft: Option<Instant>,
    drafted_generation: u64,
    full_pending: Option<RenderTicket>,
    next_seq: u64,
    displayed_seq: u64,
    stats: SessionStats,
}

impl EditSession {
    /// Idle session with default parameters.
    pub fn new(config: SessionConfig) -> Self {
        Self {
            config,
            state: SessionState::Idle,
            params: EditParameters::new(),
            generation: 0,
            last_input: None,
            last_draft: None,
            drafted_generation: 0,
            full_pending: None,
            next_seq: 0,
            displayed_seq: 0,
            stats: SessionStats::default(),
        }
    }

    /// Current refinement state.
    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Render counters so far.
    pub fn stats(&self) -> SessionStats {
        self.stats
    }

    /// Latest edit parameters.
    pub fn params(&self) -> &EditParameters {
        &self.params
    }

    /// Record new user input. Cancels any pending full render intent.
    pub fn input(&mut self, params: EditParameters, now: Instant) {
        self.generation += 1;
        self.params = params;
        self.last_input = Some(now);
        if let Some(ticket) = self.full_pending.take() {
            debug!(seq = ticket.seq, "full render superseded by input");
        }
        self.state = SessionState::Interacting;
    }

    /// The render to run now, if any.
    pub fn poll(&mut self, now: Instant) -> Option<RenderRequest> {
        match self.state {
            SessionState::Idle | SessionState::Refining => None,
            SessionState::Complete => {
                self.state = SessionState::Idle;
                None
            }
            SessionState::Interacting => {
                let since_input = self.last_input.map_or(self.config.quiet_period, |t| now.saturating_duration_since(t));
                if since_input >= self.config.quiet_period {
                    return Some(self.issue_full());
                }
                let throttled = self
                    .last_draft
                    .is_some_and(|t| now.saturating_duration_since(t) < self.config.draft_interval);
                if throttled || self.drafted_generation == self.generation {
                    return None;
                }
                self.last_draft = Some(now);
                Some(self.issue_draft())
            }
        }
    }

    fn ticket(&mut self, quality: Quality) -> RenderTicket {
        self.next_seq += 1;
        RenderTicket {
            generation: self.generation,
            seq: self.next_seq,
            quality,
        }
    }

    fn issue_draft(&mut self) -> RenderRequest {
        let ticket = self.ticket(Quality::Draft);
        self.drafted_generation = self.generation;
        self.stats.drafts += 1;
        let mut params = self.params.clone();
        params.quality = Quality::Draft;
        params.target_resolution_scale = Some(params.scale().min(self.config.draft_scale));
        trace!(seq = ticket.seq, generation = ticket.generation, "draft render issued");
        RenderRequest { ticket, params }
    }

    fn issue_full(&mut self) -> RenderRequest {
        let ticket = self.ticket(Quality::Full);
        self.full_pending = Some(ticket);
        self.state = SessionState::Refining;
        self.stats.full_renders += 1;
        let mut params = self.params.clone();
        params.quality = Quality::Full;
        debug!(seq = ticket.seq, generation = ticket.generation, "full render issued");
        RenderRequest { ticket, params }
    }

    /// Hand in a finished render. Returns the result when it should be
    /// displayed, `None` when newer work superseded it.
    pub fn complete(&mut self, ticket: RenderTicket, result: PipelineResult) -> Option<PipelineResult> {
        let current = match ticket.quality {
            Quality::Full => self.full_pending == Some(ticket),
            Quality::Draft => ticket.seq > self.displayed_seq && self.full_pending.is_none(),
        };
        if !current || ticket.seq <= self.displayed_seq {
            self.stats.discarded += 1;
            debug!(seq = ticket.seq, quality = ?ticket.quality, "stale render discarded");
            return None;
        }
        if ticket.quality == Quality::Full {
            self.full_pending = None;
            self.state = SessionState::Complete;
        }
        self.displayed_seq = ticket.seq;
        self.stats.displayed += 1;
        Some(result)
    }

    /// Forget a render that failed. A failed full render returns the
    /// session to idle so the next input starts over.
    pub fn abandon(&mut self, ticket: RenderTicket) {
        if self.full_pending == Some(ticket) {
            self.full_pending = None;
            self.state = SessionState::Idle;
        }
    }

    /// Poll, render on `pipeline` and complete in one step.
    pub fn run<G: GpuPrimitives>(
        &mut self,
        pipeline: &mut EditPipeline<G>,
        source: &PixelBuffer,
        now: Instant,
    ) -> GpuResult<Option<PipelineResult>> {
        let Some(request) = self.poll(now) else {
            return Ok(None);
        };
        match pipeline.process(source, &request.params) {
            Ok(result) => Ok(self.complete(request.ticket, result)),
            Err(e) => {
                self.abandon(request.ticket);
                Err(e)
            }
        }
    }
}

impl Default for EditSession {
    fn default() -> Self {
        Self::new(SessionConfig::default())
    }
}
