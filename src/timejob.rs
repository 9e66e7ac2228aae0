//! Time jobs: rules with a send window. Collected files wait until the cron
//! expression next fires; no-collect windows drop files that arrive outside.

use std::cmp::Reverse;
use std::collections::BinaryHeap;

use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Duration, Local, TimeZone, Timelike, Utc};

/// A parsed 5-field cron expression (minute hour day-of-month month
/// day-of-week), evaluated in local time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CronSpec {
    minutes: u64,
    hours: u32,
    dom: u32,
    months: u16,
    dow: u8,
    dom_restricted: bool,
    dow_restricted: bool,
}

fn parse_field(field: &str, min: u32, max: u32) -> Result<(u64, bool)> {
    let mut mask: u64 = 0;
    let mut restricted = true;
    for part in field.split(',') {
        let (range, step) = match part.split_once('/') {
            Some((r, s)) => {
                let step: u32 = s.parse().with_context(|| format!("步进不合法: '{}'", part))?;
                if step == 0 {
                    return Err(anyhow::anyhow!("步进不能为 0: '{}'", part));
                }
                (r, step)
            }
            None => (part, 1),
        };
        let (lo, hi) = if range == "*" {
            if step == 1 {
                restricted = false;
            }
            (min, max)
        } else if let Some((a, b)) = range.split_once('-') {
            let lo: u32 = a.parse().with_context(|| format!("范围不合法: '{}'", part))?;
            let hi: u32 = b.parse().with_context(|| format!("范围不合法: '{}'", part))?;
            (lo, hi)
        } else {
            let v: u32 = range.parse().with_context(|| format!("数值不合法: '{}'", part))?;
            (v, v)
        };
        if lo < min || hi > max || lo > hi {
            return Err(anyhow::anyhow!("字段越界 [{}..{}]: '{}'", min, max, part));
        }
        let mut v = lo;
        while v <= hi {
            mask |= 1u64 << v;
            v += step;
        }
    }
    Ok((mask, restricted))
}

impl CronSpec {
    pub fn parse(expr: &str) -> Result<CronSpec> {
        let fields: Vec<&str> = expr.split_whitespace().collect();
        if fields.len() != 5 {
            return Err(anyhow::anyhow!("cron 表达式需要 5 个字段: '{}'", expr));
        }
        let (minutes, _) = parse_field(fields[0], 0, 59)?;
        let (hours, _) = parse_field(fields[1], 0, 23)?;
        let (dom, dom_restricted) = parse_field(fields[2], 1, 31)?;
        let (months, _) = parse_field(fields[3], 1, 12)?;
        // 7 also means Sunday
        let (dow_raw, dow_restricted) = parse_field(fields[4], 0, 7)?;
        let mut dow = (dow_raw & 0x7f) as u8;
        if dow_raw & (1 << 7) != 0 {
            dow |= 1;
        }
        Ok(CronSpec {
            minutes,
            hours: hours as u32,
            dom: dom as u32,
            months: months as u16,
            dow,
            dom_restricted,
            dow_restricted,
        })
    }

    fn day_matches(&self, dt: &DateTime<Local>) -> bool {
        if self.months & (1 << dt.month()) as u16 == 0 {
            return false;
        }
        let dom_ok = self.dom & (1 << dt.day()) != 0;
        let dow_ok = self.dow & (1 << dt.weekday().num_days_from_sunday()) != 0;
        // standard rule: both restricted -> either may match
        match (self.dom_restricted, self.dow_restricted) {
            (true, true) => dom_ok || dow_ok,
            (true, false) => dom_ok,
            (false, true) => dow_ok,
            (false, false) => true,
        }
    }

    /// Whether the minute containing `t` is inside the window.
    pub fn matches(&self, t: i64) -> bool {
        let Some(utc) = DateTime::<Utc>::from_timestamp(t, 0) else {
            return false;
        };
        let dt = utc.with_timezone(&Local);
        self.day_matches(&dt)
            && self.hours & (1 << dt.hour()) != 0
            && self.minutes & (1 << dt.minute()) != 0
    }

    /// Epoch seconds of the first firing strictly after `t`. Scans at most
    /// four years of days; a spec that never fires yields None.
    pub fn next_after(&self, t: i64) -> Option<i64> {
        let utc = DateTime::<Utc>::from_timestamp(t, 0)?;
        let start = utc.with_timezone(&Local) + Duration::minutes(1);
        let start = start.with_second(0)?.with_nanosecond(0)?;
        let mut day = start.date_naive();
        for offset in 0..(4 * 366) {
            let dt_probe = Local
                .with_ymd_and_hms(day.year(), day.month(), day.day(), 12, 0, 0)
                .earliest()?;
            if self.day_matches(&dt_probe) {
                let (h0, m0) = if offset == 0 {
                    (start.hour(), start.minute())
                } else {
                    (0, 0)
                };
                for h in h0..24 {
                    if self.hours & (1 << h) == 0 {
                        continue;
                    }
                    let m_start = if h == h0 { m0 } else { 0 };
                    for m in m_start..60 {
                        if self.minutes & (1u64 << m) == 0 {
                            continue;
                        }
                        // DST gaps skip the candidate, folds take the
                        // earlier wall-clock instant
                        if let Some(fire) = Local
                            .with_ymd_and_hms(day.year(), day.month(), day.day(), h, m, 0)
                            .earliest()
                        {
                            return Some(fire.timestamp());
                        }
                    }
                }
            }
            day = day.succ_opt()?;
        }
        None
    }
}

/// One scheduled job.
#[derive(Debug, Clone)]
pub struct TimeJob {
    pub job_id: u32,
    pub spec: CronSpec,
    pub no_collect: bool,
    pub next_fire: i64,
}

/// Priority queue of jobs whose send time lies in the future. The dispatcher
/// polls `take_due` and promotes the returned job ids into the normal queue.
#[derive(Default)]
pub struct TimeJobQueue {
    heap: BinaryHeap<Reverse<(i64, u32)>>,
    jobs: std::collections::HashMap<u32, TimeJob>,
}

impl TimeJobQueue {
    pub fn new() -> TimeJobQueue {
        TimeJobQueue::default()
    }

    pub fn len(&self) -> usize {
        self.jobs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.jobs.is_empty()
    }

    pub fn contains(&self, job_id: u32) -> bool {
        self.jobs.contains_key(&job_id)
    }

    pub fn job(&self, job_id: u32) -> Option<&TimeJob> {
        self.jobs.get(&job_id)
    }

    /// Register (or refresh) a time job; computes its first firing after `now`.
    pub fn schedule(&mut self, job_id: u32, spec: CronSpec, no_collect: bool, now: i64) {
        let next_fire = spec.next_after(now).unwrap_or(i64::MAX);
        self.jobs.insert(job_id, TimeJob { job_id, spec, no_collect, next_fire });
        self.heap.push(Reverse((next_fire, job_id)));
    }

    pub fn remove(&mut self, job_id: u32) {
        self.jobs.remove(&job_id);
        // stale heap entries are discarded lazily in take_due
    }

    /// Earliest pending fire time, for the dispatcher's poll interval.
    pub fn next_wakeup(&self) -> Option<i64> {
        self.jobs.values().map(|j| j.next_fire).min()
    }

    /// Pop every job due at `now`, rescheduling each for its next window.
    pub fn take_due(&mut self, now: i64) -> Vec<u32> {
        let mut due = Vec::new();
        while let Some(&Reverse((fire, job_id))) = self.heap.peek() {
            if fire > now {
                break;
            }
            self.heap.pop();
            let Some(job) = self.jobs.get_mut(&job_id) else {
                continue; // removed; lazy discard
            };
            if job.next_fire != fire {
                continue; // superseded by a reschedule
            }
            due.push(job_id);
            let next = job.spec.next_after(now).unwrap_or(i64::MAX);
            job.next_fire = next;
            self.heap.push(Reverse((next, job_id)));
        }
        due
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ts(y: i32, mo: u32, d: u32, h: u32, mi: u32) -> i64 {
        Local.with_ymd_and_hms(y, mo, d, h, mi, 0).earliest().expect("ts").timestamp()
    }

    #[test]
    fn every_minute_fires_next_minute() {
        let spec = CronSpec::parse("* * * * *").expect("parse");
        let t = ts(2026, 3, 10, 9, 30);
        assert_eq!(spec.next_after(t), Some(ts(2026, 3, 10, 9, 31)));
        assert!(spec.matches(t));
    }

    #[test]
    fn daily_noon_window() {
        let spec = CronSpec::parse("0 12 * * *").expect("parse");
        let t = ts(2026, 3, 10, 13, 0);
        assert_eq!(spec.next_after(t), Some(ts(2026, 3, 11, 12, 0)));
        assert!(!spec.matches(t));
        assert!(spec.matches(ts(2026, 3, 11, 12, 0)));
    }

    #[test]
    fn weekday_restriction() {
        // 2026-03-14 is a Saturday; next weekday firing is Monday the 16th
        let spec = CronSpec::parse("30 8 * * 1-5").expect("parse");
        let t = ts(2026, 3, 14, 0, 0);
        assert_eq!(spec.next_after(t), Some(ts(2026, 3, 16, 8, 30)));
    }

    #[test]
    fn step_and_list_fields() {
        let spec = CronSpec::parse("*/15 0,12 1 * *").expect("parse");
        let t = ts(2026, 4, 1, 0, 16);
        assert_eq!(spec.next_after(t), Some(ts(2026, 4, 1, 0, 30)));
    }

    #[test]
    fn rejects_malformed_specs() {
        assert!(CronSpec::parse("* * * *").is_err());
        assert!(CronSpec::parse("61 * * * *").is_err());
        assert!(CronSpec::parse("* * * * 9").is_err());
        assert!(CronSpec::parse("*/0 * * * *").is_err());
    }

    #[test]
    fn queue_promotes_due_jobs_and_reschedules() {
        let mut q = TimeJobQueue::new();
        let spec = CronSpec::parse("* * * * *").expect("parse");
        let now = ts(2026, 3, 10, 9, 30);
        q.schedule(7, spec, false, now);
        assert!(q.take_due(now).is_empty());
        let fire = ts(2026, 3, 10, 9, 31);
        let due = q.take_due(fire);
        assert_eq!(due, vec![7]);
        // rescheduled for the following minute
        assert_eq!(q.next_wakeup(), Some(ts(2026, 3, 10, 9, 32)));
    }
}
