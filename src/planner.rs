//! Session planner
//!
//! Works out how many sessions each rated topic is still owed in its current
//! cycle and places them into open slots. The planner is a pure function of
//! its inputs: the engine loads a snapshot from the store, calls [`plan`] and
//! persists the result. Running it again on the resulting state yields no new
//! blocks.

use std::cmp::Ordering;
use std::collections::BTreeSet;

use chrono::{Duration, NaiveDate, NaiveDateTime};

use crate::availability::{Availability, Slot};
use crate::models::{
    is_weekend, monday_of, sessions_needed, Block, BlockKind, NewBlock, RatingChangeEvent,
    RatingSource, Topic, UnmetDemand, UnmetReason,
};
use crate::rerating::{high_rerating_streak, maintenance_interval_days};

/// Precedence between confidence and exam proximity when ordering demand.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PriorityOrder {
    #[default]
    RatingFirst,
    UrgencyFirst,
}

impl PriorityOrder {
    pub fn as_str(&self) -> &'static str {
        match self {
            PriorityOrder::RatingFirst => "rating",
            PriorityOrder::UrgencyFirst => "urgency",
        }
    }

    pub fn from_str(s: &str) -> Option<Self> {
        match s.trim().to_lowercase().as_str() {
            "rating" | "rating_first" | "confidence" => Some(PriorityOrder::RatingFirst),
            "urgency" | "urgency_first" | "exam" => Some(PriorityOrder::UrgencyFirst),
            _ => None,
        }
    }

    /// Lower confidence and nearer exams come first. Topics without an exam
    /// date are least urgent. Ties fall back to syllabus order, then id.
    pub fn compare(&self, a: &Demand, b: &Demand) -> Ordering {
        let rating = a.rating.cmp(&b.rating);
        let urgency = urgency_key(a).cmp(&urgency_key(b));
        let primary = match self {
            PriorityOrder::RatingFirst => rating.then(urgency),
            PriorityOrder::UrgencyFirst => urgency.then(rating),
        };
        primary
            .then(a.order_index.cmp(&b.order_index))
            .then(a.topic_id.cmp(&b.topic_id))
    }
}

fn urgency_key(demand: &Demand) -> (bool, i64) {
    match demand.days_to_exam {
        Some(days) => (false, days),
        None => (true, 0),
    }
}

#[derive(Debug, Clone)]
pub struct RateableTopic {
    pub topic: Topic,
    pub rating: i32,
    pub exam_date: Option<NaiveDate>,
}

/// Outstanding sessions for one topic.
#[derive(Debug, Clone)]
pub struct Demand {
    pub topic_id: i64,
    pub rating: i32,
    pub days_to_exam: Option<i64>,
    pub order_index: i32,
    pub kind: BlockKind,
    pub session_total: u32,
    pub delivered: u32,
    pub remaining: u32,
    // Maintenance reviews wait until their due date
    pub not_before: Option<NaiveDate>,
    // Current-cycle blocks, in date order
    pub cycle: Vec<Block>,
    // Days already holding a session for this topic
    pub busy_days: BTreeSet<NaiveDate>,
}

impl Demand {
    pub fn is_new_cycle(&self) -> bool {
        self.delivered == 0
    }

    fn last_cycle_day(&self) -> Option<NaiveDate> {
        self.cycle.iter().map(|b| b.day()).max()
    }
}

pub struct PlanningInput<'a> {
    pub topics: &'a [RateableTopic],
    pub blocks: &'a [Block],
    pub rating_changes: &'a [RatingChangeEvent],
    pub availability: &'a Availability,
    pub week_start: NaiveDate,
    pub now: NaiveDateTime,
    pub block_minutes: i64,
    pub first_week: bool,
    pub priority: PriorityOrder,
}

#[derive(Debug, Clone, Default)]
pub struct Allocation {
    pub new_blocks: Vec<NewBlock>,
    // (block id, corrected session number) for scheduled blocks
    pub renumbered: Vec<(i64, u32)>,
    pub unmet: Vec<UnmetDemand>,
}

/// A user's first planned week is the one holding their earliest block, or
/// any week if they have none yet.
pub fn is_first_week(blocks: &[Block], week_start: NaiveDate) -> bool {
    match blocks.iter().map(|b| b.day()).min() {
        Some(earliest) => monday_of(earliest) >= week_start,
        None => true,
    }
}

/// Days of availability the planner needs for a week.
pub fn horizon_days(first_week: bool) -> u32 {
    if first_week {
        14
    } else {
        7
    }
}

pub fn compute_demand(input: &PlanningInput) -> Vec<Demand> {
    let week_end = input.week_start + Duration::days(7);
    let mut demands = Vec::new();

    for rateable in input.topics {
        if rateable.rating <= 0 || !rateable.topic.is_rateable() {
            continue;
        }
        let topic_id = rateable.topic.id;

        let mut changes: Vec<RatingChangeEvent> = input
            .rating_changes
            .iter()
            .filter(|c| c.topic_id == topic_id)
            .cloned()
            .collect();
        changes.sort_by_key(|c| (c.timestamp, c.id));
        let latest = changes.last();

        let topic_blocks: Vec<&Block> = input
            .blocks
            .iter()
            .filter(|b| b.topic_id == topic_id && b.counts_toward_cycle())
            .collect();

        // A rating change restarts the cycle; earlier blocks no longer count
        let mut cycle: Vec<Block> = topic_blocks
            .iter()
            .filter(|b| latest.map_or(true, |c| b.created_at >= c.timestamp))
            .map(|b| (*b).clone())
            .collect();
        cycle.sort_by_key(|b| (b.scheduled_at, b.id));
        let delivered = cycle.len() as u32;

        let (kind, session_total, not_before) = match sessions_needed(rateable.rating) {
            0 => match latest {
                Some(change) if change.source == RatingSource::Rerating => {
                    let streak = high_rerating_streak(&changes);
                    let due = change.timestamp.date()
                        + Duration::days(maintenance_interval_days(streak));
                    if due >= week_end {
                        continue;
                    }
                    (BlockKind::Maintenance, 1, Some(due))
                }
                _ => continue,
            },
            needed => (BlockKind::Reinforcement, needed, None),
        };

        if delivered >= session_total {
            continue;
        }

        demands.push(Demand {
            topic_id,
            rating: rateable.rating,
            days_to_exam: rateable
                .exam_date
                .map(|exam| (exam - input.week_start).num_days()),
            order_index: rateable.topic.order_index,
            kind,
            session_total,
            delivered,
            remaining: session_total - delivered,
            not_before,
            cycle,
            busy_days: topic_blocks.iter().map(|b| b.day()).collect(),
        });
    }

    demands
}

/// Scheduled blocks of a cycle take their date rank as session number, so the
/// active numbers stay contiguous after a missed session is dropped.
pub fn renumber_cycle(cycle: &[Block]) -> Vec<(i64, u32)> {
    cycle
        .iter()
        .enumerate()
        .filter_map(|(i, block)| {
            let rank = i as u32 + 1;
            let active = !block.status.is_terminal();
            (active && block.session_number != rank).then_some((block.id, rank))
        })
        .collect()
}

struct Placement {
    // Exclusive last date a session may land on
    until: NaiveDate,
    // First session of a new cycle must be a weekday inside the target week
    weekday_start_before: Option<NaiveDate>,
    all_or_nothing: bool,
}

fn placement_for(demand: &Demand, first_week: bool, week_end: NaiveDate) -> Placement {
    let multi_session = demand.remaining > 1;
    if first_week && demand.is_new_cycle() {
        Placement {
            until: week_end + Duration::days(7),
            weekday_start_before: Some(week_end),
            all_or_nothing: false,
        }
    } else if first_week && multi_session {
        Placement {
            until: week_end + Duration::days(7),
            weekday_start_before: None,
            all_or_nothing: false,
        }
    } else {
        Placement {
            until: week_end,
            weekday_start_before: None,
            // Later weeks only start a multi-session cycle that fits entirely
            all_or_nothing: demand.is_new_cycle() && multi_session,
        }
    }
}

fn pick_slots(
    demand: &Demand,
    slots: &[Slot],
    taken: &[(NaiveDateTime, NaiveDateTime)],
    placement: &Placement,
) -> Vec<Slot> {
    let mut picked: Vec<Slot> = Vec::new();
    let mut last_day = demand.last_cycle_day();

    for unit in 0..demand.remaining {
        let first_of_new_cycle = unit == 0 && demand.is_new_cycle();
        let candidate = slots.iter().find(|slot| {
            let date = slot.date();
            if date >= placement.until {
                return false;
            }
            if last_day.is_some_and(|last| date <= last) {
                return false;
            }
            if demand.busy_days.contains(&date) {
                return false;
            }
            if demand.not_before.is_some_and(|due| date < due) {
                return false;
            }
            if first_of_new_cycle {
                if let Some(before) = placement.weekday_start_before {
                    if is_weekend(date) || date >= before {
                        return false;
                    }
                }
            }
            !taken
                .iter()
                .any(|(start, end)| slot.overlaps(*start, *end))
        });

        match candidate {
            Some(slot) => {
                last_day = Some(slot.date());
                picked.push(*slot);
            }
            None => break,
        }
    }

    picked
}

pub fn plan(input: &PlanningInput) -> Allocation {
    let mut demands = compute_demand(input);
    demands.sort_by(|a, b| input.priority.compare(a, b));

    let week_end = input.week_start + Duration::days(7);
    let slots: Vec<Slot> = input
        .availability
        .slots()
        .filter(|s| s.start >= input.now && s.date() >= input.week_start)
        .copied()
        .collect();

    let mut taken: Vec<(NaiveDateTime, NaiveDateTime)> = Vec::new();
    let mut allocation = Allocation::default();

    for demand in &demands {
        allocation.renumbered.extend(renumber_cycle(&demand.cycle));

        let placement = placement_for(demand, input.first_week, week_end);
        let picked = pick_slots(demand, &slots, &taken, &placement);

        if placement.all_or_nothing && (picked.len() as u32) < demand.remaining {
            log::debug!(
                "Deferring new cycle for topic {}: {} of {} sessions fit",
                demand.topic_id,
                picked.len(),
                demand.remaining
            );
            allocation.unmet.push(UnmetDemand {
                topic_id: demand.topic_id,
                sessions: demand.remaining,
                reason: UnmetReason::Deferred,
            });
            continue;
        }

        let first_number = demand.cycle.len() as u32 + 1;
        for (i, slot) in picked.iter().enumerate() {
            let end = slot.start + Duration::minutes(input.block_minutes);
            taken.push((slot.start, end));
            allocation.new_blocks.push(NewBlock {
                topic_id: demand.topic_id,
                kind: demand.kind,
                scheduled_at: slot.start,
                duration_minutes: input.block_minutes,
                session_number: first_number + i as u32,
                session_total: demand.session_total,
            });
        }

        let short = demand.remaining - picked.len() as u32;
        if short > 0 {
            allocation.unmet.push(UnmetDemand {
                topic_id: demand.topic_id,
                sessions: short,
                reason: UnmetReason::NoCapacity,
            });
        }
    }

    allocation
}
