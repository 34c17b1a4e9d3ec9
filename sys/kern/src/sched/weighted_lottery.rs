// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.

//! Lottery scheduling with dynamic ticket adjustment.
//!
//! On top of the plain lottery, each task carries win/lose adjustment
//! rules `{delta, threshold, rounds, aggressive}`. A task that keeps
//! winning sheds tickets (floor 1); a task that keeps losing gains them
//! (cap 255). Both effects restore to the configured base when the streak
//! breaks. Non-aggressive rules clear their round counter after each
//! adjustment, so streaks must rebuild; aggressive rules let the counter
//! keep compounding.
//!
//! Invariant, audited after every selection in debug builds: the cached
//! ticket total equals the sum over the ready set.

use super::{
    data, task_state, Pick, Policy, SchedContext, WaitQueue, EVENT_OK, IDLE,
};
use crate::rand::XorShift32;
use crate::task::Tcb;
use abi::{ConfigKey, TaskConfig, TaskState};
use core::ptr::NonNull;
use slotpool::Pool;

const GROUP: u16 = 4;

/// Config key: starting (and base) ticket count, at least 1.
pub const TICKETS: ConfigKey = ConfigKey::new(GROUP, 1 << 0);
/// Config keys: ticket boost applied to losing tasks.
pub const LOSE_DELTA: ConfigKey = ConfigKey::new(GROUP, 1 << 1);
pub const LOSE_THRESHOLD: ConfigKey = ConfigKey::new(GROUP, 1 << 2);
pub const LOSE_AGGRESSIVE: ConfigKey = ConfigKey::new(GROUP, 1 << 3);
/// Config keys: ticket decay applied to winning tasks.
pub const WIN_DELTA: ConfigKey = ConfigKey::new(GROUP, 1 << 4);
pub const WIN_THRESHOLD: ConfigKey = ConfigKey::new(GROUP, 1 << 5);
pub const WIN_AGGRESSIVE: ConfigKey = ConfigKey::new(GROUP, 1 << 6);

const MAX_TICKETS: u8 = u8::MAX;

#[derive(Default)]
struct Adjustment {
    delta: u8,
    threshold: u8,
    rounds: u32,
    aggressive: bool,
}

struct TaskData {
    tickets: u8,
    base_tickets: u8,
    win: Adjustment,
    lose: Adjustment,
}

pub struct WeightedLottery<const N: usize> {
    ready: [Option<NonNull<Tcb>>; N],
    ready_count: usize,
    total_tickets: u32,
    rng: XorShift32,
    waiting: WaitQueue<N>,
    pool: Pool<TaskData, N>,
}

impl<const N: usize> WeightedLottery<N> {
    pub const fn new() -> Self {
        Self {
            ready: [None; N],
            ready_count: 0,
            total_tickets: 0,
            rng: XorShift32::new(0),
            waiting: WaitQueue::new(),
            pool: Pool::new(),
        }
    }

    fn insert(&mut self, task: NonNull<Tcb>) {
        for slot in self.ready.iter_mut() {
            if slot.is_none() {
                *slot = Some(task);
                self.ready_count += 1;
                // Safety: configure_task installed the data.
                self.total_tickets +=
                    unsafe { data::<TaskData>(task).tickets as u32 };
                return;
            }
        }
        debug_assert!(false, "ready array sized below the task count");
    }

    fn remove(&mut self, task: NonNull<Tcb>) {
        for slot in self.ready.iter_mut() {
            if *slot == Some(task) {
                *slot = None;
                self.ready_count -= 1;
                // Safety: configure_task installed the data.
                self.total_tickets -=
                    unsafe { data::<TaskData>(task).tickets as u32 };
                return;
            }
        }
    }

    /// Draws a winner among the runnable slots, shuffling DONE and WAIT
    /// tasks out of the ready set on the way.
    fn draw(&mut self, ctx: &mut dyn SchedContext) -> Option<NonNull<Tcb>> {
        if self.total_tickets == 0 {
            return None;
        }
        let draw = self.rng.next() % self.total_tickets;

        let mut accumulated = 0;
        let mut checked = 0;
        for idx in 0..N {
            if checked >= self.ready_count {
                break;
            }
            let Some(task) = self.ready[idx] else {
                continue;
            };
            checked += 1;
            match task_state(task) {
                TaskState::Ready | TaskState::Running => {
                    // Safety: configure_task installed the data.
                    accumulated +=
                        unsafe { data::<TaskData>(task).tickets as u32 };
                    if draw < accumulated {
                        return Some(task);
                    }
                }
                TaskState::Done => {
                    self.remove(task);
                    ctx.task_done(task);
                }
                TaskState::Wait => {
                    self.remove(task);
                    self.waiting.push(task);
                }
                TaskState::None => {}
            }
        }
        None
    }

    /// Win-side bookkeeping for the task that just won the draw.
    fn decay_winner(&mut self, winner: NonNull<Tcb>) {
        // Safety: configure_task installed the data.
        let d = unsafe { data::<TaskData>(winner) };
        d.win.rounds += 1;

        // Winning breaks a losing streak: any accumulated boost is taken
        // back. The adjustment can run in either direction, so keep the
        // additions ahead of the subtraction.
        if d.lose.rounds > 0 {
            d.lose.rounds = 0;
            self.total_tickets =
                self.total_tickets + d.base_tickets as u32
                    - d.tickets as u32;
            d.tickets = d.base_tickets;
        }

        if d.win.rounds >= d.win.threshold as u32 {
            if d.tickets > d.win.delta {
                d.tickets -= d.win.delta;
                self.total_tickets -= d.win.delta as u32;
            } else {
                self.total_tickets -= (d.tickets - 1) as u32;
                d.tickets = 1;
            }
            if !d.win.aggressive {
                d.win.rounds = 0;
            }
        }
    }

    /// Lose-side bookkeeping for every runnable task that did not win.
    fn adjust_losers(&mut self, winner: NonNull<Tcb>) {
        for idx in 0..N {
            let Some(task) = self.ready[idx] else {
                continue;
            };
            if task == winner {
                continue;
            }
            // Safety: configure_task installed the data.
            let d = unsafe { data::<TaskData>(task) };

            // Losing breaks a winning streak: decayed tickets recover.
            if d.win.rounds > 0 {
                d.win.rounds = 0;
                self.total_tickets =
                    self.total_tickets + d.base_tickets as u32
                        - d.tickets as u32;
                d.tickets = d.base_tickets;
            }

            d.lose.rounds += 1;
            if d.lose.rounds >= d.lose.threshold as u32 {
                let headroom = MAX_TICKETS - d.tickets;
                let boost = d.lose.delta.min(headroom);
                d.tickets += boost;
                self.total_tickets += boost as u32;
            }
            if !d.lose.aggressive {
                d.lose.rounds = 0;
            }
        }
    }

    #[cfg(debug_assertions)]
    fn audit_tickets(&self) {
        let mut sum = 0u32;
        for slot in self.ready.iter().flatten() {
            // Safety: configure_task installed the data.
            sum += unsafe { data::<TaskData>(*slot).tickets as u32 };
        }
        assert_eq!(
            sum, self.total_tickets,
            "ticket accounting out of balance"
        );
    }
}

impl<const N: usize> Default for WeightedLottery<N> {
    fn default() -> Self {
        Self::new()
    }
}

impl<const N: usize> Policy for WeightedLottery<N> {
    fn configure_task(
        &mut self,
        mut task: NonNull<Tcb>,
        cfg: &TaskConfig,
        _now: u32,
    ) {
        let slot = self
            .pool
            .alloc(TaskData {
                tickets: 1,
                base_tickets: 1,
                win: Adjustment {
                    delta: 1,
                    threshold: 1,
                    rounds: 0,
                    aggressive: false,
                },
                lose: Adjustment {
                    delta: 1,
                    threshold: 1,
                    rounds: 0,
                    aggressive: false,
                },
            })
            .expect("scheduler data pool exhausted");

        cfg.update(TICKETS, &mut slot.tickets);
        assert!(slot.tickets > 0, "a task needs at least one ticket");
        slot.base_tickets = slot.tickets;

        cfg.update(LOSE_DELTA, &mut slot.lose.delta);
        cfg.update(LOSE_THRESHOLD, &mut slot.lose.threshold);
        cfg.update(LOSE_AGGRESSIVE, &mut slot.lose.aggressive);

        cfg.update(WIN_DELTA, &mut slot.win.delta);
        cfg.update(WIN_THRESHOLD, &mut slot.win.threshold);
        cfg.update(WIN_AGGRESSIVE, &mut slot.win.aggressive);

        // Safety: the task ref is live; we own its sched_data slot.
        unsafe {
            task.as_mut().set_sched_data(slot as *mut TaskData as *mut ());
        }
    }

    fn clear_task(&mut self, task: NonNull<Tcb>) {
        self.remove(task);
        // Safety: sched_data was installed by configure_task above.
        unsafe {
            self.pool.free(task.as_ref().sched_data::<TaskData>());
        }
    }

    fn add_task(&mut self, task: NonNull<Tcb>) {
        self.insert(task);
        self.rng.reseed(crate::arch::systick_value());
    }

    fn next_task(&mut self, now: u32, ctx: &mut dyn SchedContext) -> Pick {
        let mut woken = [None; N];
        let mut woken_count = 0;
        self.waiting.process(now, |t| {
            woken[woken_count] = Some(t);
            woken_count += 1;
        });
        for slot in woken.iter().take(woken_count) {
            if let Some(t) = *slot {
                self.insert(t);
            }
        }

        let winner = loop {
            match self.draw(ctx) {
                Some(winner) => {
                    self.decay_winner(winner);
                    self.adjust_losers(winner);
                    break Some(winner);
                }
                None => {
                    // Nothing runnable left; if tasks remain they are in
                    // ranges vacated this pass, so redraw, else idle.
                    if self.ready_count == 0 || self.total_tickets == 0 {
                        break None;
                    }
                }
            }
        };

        #[cfg(debug_assertions)]
        self.audit_tickets();

        match winner {
            Some(task) => (Some(task), EVENT_OK),
            None => IDLE,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sched::testutil::*;
    use crate::task::TaskObject;

    fn data_of(task: NonNull<Tcb>) -> &'static mut TaskData {
        unsafe { data::<TaskData>(task) }
    }

    fn add(
        sched: &mut WeightedLottery<8>,
        task: &mut TaskObject<STACK>,
        cfg: TaskConfig,
    ) {
        sched.configure_task(tref(task), &cfg, 0);
        sched.add_task(tref(task));
    }

    #[test]
    fn winner_decays_after_threshold() {
        let mut sched = WeightedLottery::<8>::new();
        let mut ctx = TestCtx::default();
        let mut hog = make_task(TaskState::Ready);
        let mut other = make_task(TaskState::Ready);
        add(
            &mut sched,
            &mut hog,
            TaskConfig::new()
                .set(TICKETS, 200)
                .set(WIN_DELTA, 50)
                .set(WIN_THRESHOLD, 2)
                .set(WIN_AGGRESSIVE, 1),
        );
        add(&mut sched, &mut other, TaskConfig::new().set(TICKETS, 1));

        // With 200:1 tickets the hog wins essentially every round; its
        // aggressive win decay must grind its tickets down. A lost round
        // restores the base, so watch the minimum rather than the final
        // value.
        let mut min_seen = u8::MAX;
        for _ in 0..64 {
            sched.next_task(0, &mut ctx);
            min_seen = min_seen.min(data_of(tref(&mut hog)).tickets);
        }
        assert!(min_seen < 200, "winner never decayed: {min_seen} tickets");
    }

    #[test]
    fn loser_gains_up_to_the_cap() {
        let mut sched = WeightedLottery::<8>::new();
        let mut ctx = TestCtx::default();
        let mut hog = make_task(TaskState::Ready);
        let mut meek = make_task(TaskState::Ready);
        add(&mut sched, &mut hog, TaskConfig::new().set(TICKETS, 250));
        add(
            &mut sched,
            &mut meek,
            TaskConfig::new()
                .set(TICKETS, 1)
                .set(LOSE_DELTA, 100)
                .set(LOSE_THRESHOLD, 1),
        );

        for _ in 0..64 {
            sched.next_task(0, &mut ctx);
        }
        let d = data_of(tref(&mut meek));
        // Boosted while losing, but never past the cap.
        assert!(d.tickets > 1);
        assert!(d.tickets <= MAX_TICKETS);
    }

    #[test]
    fn winning_breaks_a_losing_streak() {
        let mut sched = WeightedLottery::<8>::new();
        let mut ctx = TestCtx::default();
        let mut a = make_task(TaskState::Ready);
        let mut b = make_task(TaskState::Ready);
        add(
            &mut sched,
            &mut a,
            TaskConfig::new()
                .set(TICKETS, 10)
                .set(LOSE_DELTA, 20)
                .set(LOSE_THRESHOLD, 1),
        );
        add(
            &mut sched,
            &mut b,
            TaskConfig::new()
                .set(TICKETS, 10)
                .set(LOSE_DELTA, 20)
                .set(LOSE_THRESHOLD, 1),
        );

        // Run until each task has won at least once; every win resets
        // that task to its base tickets.
        let (mut a_won, mut b_won) = (false, false);
        for _ in 0..256 {
            let (picked, _) = sched.next_task(0, &mut ctx);
            if picked == Some(tref(&mut a)) {
                a_won = true;
                assert_eq!(data_of(tref(&mut a)).tickets, 10);
            }
            if picked == Some(tref(&mut b)) {
                b_won = true;
                assert_eq!(data_of(tref(&mut b)).tickets, 10);
            }
            if a_won && b_won {
                break;
            }
        }
        assert!(a_won && b_won);
    }

    #[test]
    fn accounting_survives_churn() {
        let mut sched = WeightedLottery::<8>::new();
        let mut ctx = TestCtx::default();
        let mut tasks: Vec<_> =
            (0..4).map(|_| make_task(TaskState::Ready)).collect();
        for (i, t) in tasks.iter_mut().enumerate() {
            add(
                &mut sched,
                t,
                TaskConfig::new()
                    .set(TICKETS, 5 + i)
                    .set(WIN_DELTA, 2)
                    .set(WIN_THRESHOLD, 3)
                    .set(LOSE_DELTA, 3)
                    .set(LOSE_THRESHOLD, 2)
                    .set(LOSE_AGGRESSIVE, 1),
            );
        }

        // Sleep and wake tasks while selections churn the ticket pot; the
        // debug audit inside next_task does the heavy checking.
        for round in 0u32..200 {
            if round % 17 == 3 {
                tasks[(round % 4) as usize].tcb.descriptor.state =
                    TaskState::Wait;
                tasks[(round % 4) as usize]
                    .tcb
                    .descriptor
                    .timing
                    .next_run = round + 9;
            }
            sched.next_task(round, &mut ctx);
        }
    }
}
