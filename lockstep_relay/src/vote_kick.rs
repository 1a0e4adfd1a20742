// Vote-kick state machine.
//
// At most one vote runs at a time. The server rebuilds a `VoteContext` from
// the lobby for every ballot, so eligibility always reflects the current
// roster: a voter "has power" if it is an admin, or alive and in a slot.
//
// Counting, for a vote against `kickee`:
// - eligible = empowered clients other than the kickee
// - if the kickee itself has power it counts as one more eligible voter and
//   one automatic vote against
// - needed = eligible / 2 + 1
// - the vote passes when for-votes reach `needed` and fails when
//   against-votes reach `needed`; the initiator of a failed vote is put on a
//   cooldown before they may start another
//
// Ballots may be changed while the vote is open, so an even split stays open
// until someone switches or the timer runs out. A lone empowered player may
// remove a powerless target without a vote.

use std::collections::{BTreeMap, HashMap};
use std::time::{Duration, Instant};

use lockstep_protocol::ClientIndex;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Voter {
    pub index: ClientIndex,
    pub has_power: bool,
}

#[derive(Clone, Copy, Debug)]
pub struct VoteContext<'a> {
    pub game_started: bool,
    pub dedicated: bool,
    pub kickee_is_admin: bool,
    pub voters: &'a [Voter],
}

impl VoteContext<'_> {
    fn has_power(&self, index: ClientIndex) -> bool {
        self.voters
            .iter()
            .any(|v| v.index == index && v.has_power)
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteRejection {
    GameNotStarted,
    SelfKick,
    KickeeIsAdmin,
    NotEligible,
    OtherVoteInProgress(ClientIndex),
    NoVoteInProgress,
    OnCooldown(Duration),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum VoteOutcome {
    Rejected(VoteRejection),
    Started,
    Recorded,
    Passed(ClientIndex),
    Failed(ClientIndex),
    /// A lone empowered player removed a powerless target.
    InstantKick(ClientIndex),
    TimedOut(ClientIndex),
    Cancelled(ClientIndex),
}

#[derive(Debug)]
struct ActiveVote {
    kickee: ClientIndex,
    initiator: ClientIndex,
    ballots: BTreeMap<ClientIndex, bool>,
    deadline: Instant,
}

#[derive(Debug)]
pub struct VoteKickTracker {
    timer: Duration,
    no_repeat: Duration,
    active: Option<ActiveVote>,
    cooldowns: HashMap<ClientIndex, Instant>,
}

impl VoteKickTracker {
    pub fn new(timer: Duration, no_repeat: Duration) -> Self {
        Self {
            timer,
            no_repeat,
            active: None,
            cooldowns: HashMap::new(),
        }
    }

    pub fn active_kickee(&self) -> Option<ClientIndex> {
        self.active.as_ref().map(|v| v.kickee)
    }

    /// Cast a ballot from `voter` on kicking `kickee`, starting a vote if
    /// none is running.
    pub fn vote(
        &mut self,
        ctx: &VoteContext<'_>,
        voter: ClientIndex,
        kickee: ClientIndex,
        in_favor: bool,
        now: Instant,
    ) -> VoteOutcome {
        if !ctx.game_started {
            return VoteOutcome::Rejected(VoteRejection::GameNotStarted);
        }
        if voter == kickee {
            return VoteOutcome::Rejected(VoteRejection::SelfKick);
        }
        if ctx.kickee_is_admin && !ctx.dedicated {
            return VoteOutcome::Rejected(VoteRejection::KickeeIsAdmin);
        }
        if !ctx.has_power(voter) {
            return VoteOutcome::Rejected(VoteRejection::NotEligible);
        }

        match &mut self.active {
            Some(active) if active.kickee != kickee => {
                VoteOutcome::Rejected(VoteRejection::OtherVoteInProgress(active.kickee))
            }
            Some(active) => {
                active.ballots.insert(voter, in_favor);
                self.resolve(ctx, now).unwrap_or(VoteOutcome::Recorded)
            }
            None => self.start(ctx, voter, kickee, in_favor, now),
        }
    }

    fn start(
        &mut self,
        ctx: &VoteContext<'_>,
        initiator: ClientIndex,
        kickee: ClientIndex,
        in_favor: bool,
        now: Instant,
    ) -> VoteOutcome {
        if !in_favor {
            return VoteOutcome::Rejected(VoteRejection::NoVoteInProgress);
        }
        if let Some(&until) = self.cooldowns.get(&initiator) {
            if now < until {
                return VoteOutcome::Rejected(VoteRejection::OnCooldown(until - now));
            }
            self.cooldowns.remove(&initiator);
        }

        let others_empowered = ctx
            .voters
            .iter()
            .filter(|v| v.has_power && v.index != kickee)
            .count();
        if others_empowered == 1 && !ctx.has_power(kickee) {
            return VoteOutcome::InstantKick(kickee);
        }

        let mut ballots = BTreeMap::new();
        ballots.insert(initiator, true);
        self.active = Some(ActiveVote {
            kickee,
            initiator,
            ballots,
            deadline: now + self.timer,
        });
        self.resolve(ctx, now).unwrap_or(VoteOutcome::Started)
    }

    /// Check the open vote against the threshold, ending it if decided.
    fn resolve(&mut self, ctx: &VoteContext<'_>, now: Instant) -> Option<VoteOutcome> {
        let active = self.active.as_ref()?;
        let kickee = active.kickee;

        let empowered: Vec<ClientIndex> = ctx
            .voters
            .iter()
            .filter(|v| v.has_power && v.index != kickee)
            .map(|v| v.index)
            .collect();
        let counted = |want: bool| {
            active
                .ballots
                .iter()
                .filter(|(i, v)| **v == want && empowered.contains(i))
                .count()
        };
        let mut eligible = empowered.len();
        let in_favor = counted(true);
        let mut against = counted(false);
        if ctx.has_power(kickee) {
            eligible += 1;
            against += 1;
        }
        let needed = eligible / 2 + 1;

        if in_favor >= needed {
            self.active = None;
            return Some(VoteOutcome::Passed(kickee));
        }
        if against >= needed {
            let initiator = active.initiator;
            self.active = None;
            self.cooldowns.insert(initiator, now + self.no_repeat);
            return Some(VoteOutcome::Failed(kickee));
        }
        None
    }

    /// End a vote whose timer ran out. No cooldown is applied.
    pub fn tick(&mut self, now: Instant) -> Option<VoteOutcome> {
        let active = self.active.as_ref()?;
        if now < active.deadline {
            return None;
        }
        let kickee = active.kickee;
        self.active = None;
        Some(VoteOutcome::TimedOut(kickee))
    }

    /// A client left. Cancels the vote if it was the kickee, otherwise drops
    /// its ballot.
    pub fn client_dropped(&mut self, client: ClientIndex) -> Option<VoteOutcome> {
        self.cooldowns.remove(&client);
        let active = self.active.as_mut()?;
        if active.kickee == client {
            self.active = None;
            return Some(VoteOutcome::Cancelled(client));
        }
        active.ballots.remove(&client);
        None
    }

    pub fn reset(&mut self) {
        self.active = None;
        self.cooldowns.clear();
    }
}
