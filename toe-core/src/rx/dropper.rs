use crate::{channels::Channels, engine::Stage, types::Verdict};

/// Lets a segment's payload through only when both the resolver and the
/// state machine voted to keep it.
///
/// The resolver votes on every payload it sees and the state machine only on
/// payloads the resolver kept, so a resolver drop settles the segment without
/// waiting for a second vote.
#[derive(Debug, Default)]
pub struct SegmentDropper {
    /// The verdict for the segment whose words are being moved
    current: Option<Verdict>,
}

impl SegmentDropper {
    pub fn new() -> Self {
        Self::default()
    }
}

impl Stage for SegmentDropper {
    fn step(&mut self, ch: &mut Channels) {
        let verdict = match self.current {
            Some(verdict) => verdict,
            None => {
                let verdict = match ch.resolver_verdicts.peek() {
                    None => return,
                    Some(Verdict::Drop) => Verdict::Drop,
                    Some(Verdict::Keep) => match ch.fsm_verdicts.pop() {
                        Some(verdict) => verdict,
                        None => return,
                    },
                };
                ch.resolver_verdicts.pop();
                self.current = Some(verdict);
                verdict
            }
        };

        if verdict.keep() && ch.kept_payload.is_full() {
            return;
        }
        let Some(word) = ch.rx_payload.pop() else {
            return;
        };
        if verdict.keep() {
            let _ = ch.kept_payload.push(word);
        }
        if word.last {
            self.current = None;
        }
    }

    fn is_idle(&self) -> bool {
        self.current.is_none()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::ToeConfig,
        wire::{to_words, Word},
    };

    fn feed(ch: &mut Channels, len: u8) {
        let bytes: Vec<u8> = (0..len).collect();
        for word in to_words(&bytes) {
            ch.rx_payload.push(word).unwrap();
        }
    }

    #[test]
    fn needs_both_votes() {
        let mut ch = Channels::new(&ToeConfig::default());
        let mut dropper = SegmentDropper::new();
        // Resolver drop, resolver keep + fsm drop, both keep
        feed(&mut ch, 10);
        feed(&mut ch, 10);
        feed(&mut ch, 12);
        ch.resolver_verdicts.push(Verdict::Drop).unwrap();
        ch.resolver_verdicts.push(Verdict::Keep).unwrap();
        ch.resolver_verdicts.push(Verdict::Keep).unwrap();
        ch.fsm_verdicts.push(Verdict::Drop).unwrap();
        ch.fsm_verdicts.push(Verdict::Keep).unwrap();
        for _ in 0..10 {
            dropper.step(&mut ch);
        }
        let kept: Vec<Word> = ch.kept_payload.drain().collect();
        assert_eq!(kept.len(), 2);
        assert_eq!(kept[0].len(), 8);
        assert_eq!(kept[1].len(), 4);
        assert!(kept[1].last);
        assert!(ch.rx_payload.is_empty());
        assert!(dropper.is_idle());
    }

    #[test]
    fn waits_for_the_state_machine() {
        let mut ch = Channels::new(&ToeConfig::default());
        let mut dropper = SegmentDropper::new();
        feed(&mut ch, 4);
        ch.resolver_verdicts.push(Verdict::Keep).unwrap();
        dropper.step(&mut ch);
        assert_eq!(ch.rx_payload.len(), 1);
        ch.fsm_verdicts.push(Verdict::Keep).unwrap();
        dropper.step(&mut ch);
        assert_eq!(ch.kept_payload.len(), 1);
    }
}
