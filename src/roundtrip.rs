//! Cross-core round trip over signal slots.
//!
//! Slot `i` of a [`SignalChannel`] is waited on by core `i` only. A sender on
//! core `c` signals its receiver on core `c + offset` by posting to the
//! receiver's slot; the receiver answers by posting to slot `c`. With
//! [`PayloadKind::Timestamp`] the answer is the receiver's own clock reading,
//! and the round trip ends at the earlier of that payload and the sender's
//! end timestamp. A payload below the start timestamp surfaces as a clock
//! anomaly in the sampler.

use std::num::NonZeroU64;

use crate::clock::CycleClock;
use crate::completion::CompletionFlag;
use crate::config::PayloadKind;
use crate::error::Result;
use crate::sampler::{Probe, Window};
use crate::signal::{SignalChannel, Slot};

const SENTINEL: NonZeroU64 = NonZeroU64::MIN;

fn nonzero(value: u64) -> NonZeroU64 {
    NonZeroU64::new(value).unwrap_or(SENTINEL)
}

/// Sender side: one signal/reply exchange per attempt.
#[derive(Debug)]
pub struct RoundTripProbe<'a> {
    request: Slot<'a>,
    reply: Slot<'a>,
    payload: PayloadKind,
}

impl<'a> RoundTripProbe<'a> {
    /// Connect `sender` to the receiver at `sender + offset`.
    ///
    /// Spins until the receiver announced readiness.
    pub fn connect(
        channel: &'a SignalChannel,
        sender: usize,
        offset: usize,
        payload: PayloadKind,
    ) -> Result<Self> {
        let receiver = channel.slot_for(sender, offset)?;
        channel.wait_ready(receiver)?;
        Ok(Self {
            request: channel.slot(receiver)?,
            reply: channel.slot(sender)?,
            payload,
        })
    }
}

impl<C: CycleClock + ?Sized> Probe<C> for RoundTripProbe<'_> {
    fn prepare(&mut self) {
        self.reply.reset();
    }

    #[inline]
    fn measure(&mut self, clock: &C) -> Window {
        let start = clock.now();
        self.request.post(nonzero(start));
        let payload = self.reply.wait().get();
        let end = clock.now();
        let end = match self.payload {
            PayloadKind::Timestamp => payload.min(end),
            PayloadKind::Sentinel => end,
        };
        Window {
            start,
            end,
            result: 0,
        }
    }
}

/// Receiver side: answers every request until the run completes.
#[derive(Debug)]
pub struct Responder<'a, C> {
    request: Slot<'a>,
    reply: Slot<'a>,
    clock: C,
    payload: PayloadKind,
}

impl<'a, C: CycleClock> Responder<'a, C> {
    /// Bind the receiver at `sender + offset` and announce readiness.
    pub fn bind(
        channel: &'a SignalChannel,
        sender: usize,
        offset: usize,
        clock: C,
        payload: PayloadKind,
    ) -> Result<Self> {
        let receiver = channel.slot_for(sender, offset)?;
        let request = channel.slot(receiver)?;
        let reply = channel.slot(sender)?;
        request.reset();
        channel.mark_ready(receiver)?;
        Ok(Self {
            request,
            reply,
            clock,
            payload,
        })
    }

    /// Answer requests until `done` is set. Returns how many were answered.
    ///
    /// The flag is polled only between requests, never while answering one.
    pub fn serve(&self, done: &CompletionFlag) -> u64 {
        let mut served = 0u64;
        loop {
            if self.request.take().is_some() {
                let answer = match self.payload {
                    PayloadKind::Timestamp => nonzero(self.clock.now()),
                    PayloadKind::Sentinel => SENTINEL,
                };
                self.reply.post(answer);
                served += 1;
            } else if done.is_set() {
                return served;
            } else {
                core::hint::spin_loop();
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Tsc;
    use crate::config::SamplerConfig;
    use crate::sampler::Sampler;
    use crate::tick::SharedTick;
    use std::sync::Arc;
    use std::thread;

    fn run_round_trips(payload: PayloadKind, samples: usize) -> (u64, u64) {
        let channel = Arc::new(SignalChannel::new(2, 2));
        let done = Arc::new(CompletionFlag::new());

        let receiver = {
            let channel = channel.clone();
            let done = done.clone();
            thread::spawn(move || {
                let responder = Responder::bind(&channel, 0, 1, Tsc, payload).unwrap();
                responder.serve(&done)
            })
        };

        let mut probe = RoundTripProbe::connect(&channel, 0, 1, payload).unwrap();
        let sampler = Sampler::new(Tsc, SharedTick::new(), SamplerConfig::new().samples(samples));
        let report = sampler.run_probe("roundtrip", &mut probe);
        done.set();

        (report.completed, receiver.join().unwrap())
    }

    #[test]
    fn every_attempt_is_answered() {
        let (completed, served) = run_round_trips(PayloadKind::Timestamp, 200);
        assert_eq!(completed, 200);
        // Rejected attempts are answered too.
        assert!(served >= 200);
    }

    #[test]
    fn sentinel_payload_round_trips() {
        let (completed, served) = run_round_trips(PayloadKind::Sentinel, 50);
        assert_eq!(completed, 50);
        assert!(served >= 50);
    }

    #[test]
    fn stale_reply_is_cleared_before_each_attempt() {
        let channel = SignalChannel::new(2, 2);
        channel.mark_ready(1).unwrap();
        let mut probe = RoundTripProbe::connect(&channel, 0, 1, PayloadKind::Sentinel).unwrap();
        channel.slot(0).unwrap().post_value(99).unwrap();
        Probe::<Tsc>::prepare(&mut probe);
        assert!(channel.slot(0).unwrap().poll().is_none());
    }

    #[test]
    fn receiver_out_of_range_is_an_error() {
        let channel = SignalChannel::new(2, 2);
        assert!(Responder::bind(&channel, 1, 1, Tsc, PayloadKind::Timestamp).is_err());
    }
}
