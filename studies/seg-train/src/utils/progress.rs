use std::time::{ Duration, Instant };

use chrono::{ DateTime, Local };

/// Batch indices at which progress gets reported.
///
/// Reports grow geometrically by `backoff`, and the first one comes after
/// the `start_ndx` warm-up items (background workers filling their queues)
/// so estimates are not skewed by the start of an epoch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReportSchedule {
    backoff: usize,
    next: usize,
}

impl ReportSchedule {
    pub fn new(len: usize, start_ndx: usize) -> Self {
        let mut backoff = 2usize;
        while backoff.saturating_pow(7) < len {
            backoff *= 2;
        }

        let mut next = 4usize;
        while next < start_ndx.saturating_mul(backoff) {
            next *= backoff;
        }

        ReportSchedule { backoff, next }
    }

    pub fn backoff(&self) -> usize {
        self.backoff
    }

    /// Whether `ndx` is a reporting point; moves the schedule on when it is.
    pub fn hit(&mut self, ndx: usize) -> bool {
        if ndx != self.next {
            return false;
        }
        self.next = self.next.saturating_mul(self.backoff);
        true
    }
}

/// `enumerate()` that logs when the loop is expected to finish.
///
/// Logs `"{desc} ----/{len}, starting"` up front, then
/// `"{desc} {ndx}/{len}, done at {time}, {duration}"` at each
/// [`ReportSchedule`] point, and `"{desc} ----/{len}, done at {time}"` once the
/// inner iterator is exhausted. Bookkeeping for an item runs when the next one
/// is requested, so estimates include the caller's work on it.
pub struct EnumerateWithEstimate<I> {
    inner: I,
    desc: String,
    len: usize,
    start_ndx: usize,
    schedule: ReportSchedule,
    started_at: Instant,
    started_wall: DateTime<Local>,
    pending: Option<usize>,
    next_ndx: usize,
    finished: bool,
}

impl<I: Iterator> EnumerateWithEstimate<I> {
    pub fn new(inner: I, desc: impl Into<String>, len: usize, start_ndx: usize) -> Self {
        let desc = desc.into();
        log::info!("{} ----/{}, starting", desc, len);

        EnumerateWithEstimate {
            inner,
            desc,
            len,
            start_ndx,
            schedule: ReportSchedule::new(len, start_ndx),
            started_at: Instant::now(),
            started_wall: Local::now(),
            pending: None,
            next_ndx: 0,
            finished: false,
        }
    }

    fn after_item(&mut self, ndx: usize) {
        if self.schedule.hit(ndx) {
            let done = (ndx + 1).saturating_sub(self.start_ndx).max(1);
            let remaining = self.len.saturating_sub(self.start_ndx);
            let estimate = self.started_at.elapsed().mul_f64((remaining as f64) / (done as f64));
            let done_at = self.started_wall +
                chrono::Duration::from_std(estimate).unwrap_or_else(|_| chrono::Duration::zero());

            log::info!(
                "{} {:>4}/{}, done at {}, {}",
                self.desc,
                ndx,
                self.len,
                done_at.format("%Y-%m-%d %H:%M:%S"),
                format_duration(estimate)
            );
        }

        if ndx + 1 == self.start_ndx {
            self.started_at = Instant::now();
            self.started_wall = Local::now();
        }
    }
}

impl<I: Iterator> Iterator for EnumerateWithEstimate<I> {
    type Item = (usize, I::Item);

    fn next(&mut self) -> Option<Self::Item> {
        if let Some(ndx) = self.pending.take() {
            self.after_item(ndx);
        }

        match self.inner.next() {
            Some(item) => {
                let ndx = self.next_ndx;
                self.next_ndx += 1;
                self.pending = Some(ndx);
                Some((ndx, item))
            }
            None => {
                if !self.finished {
                    self.finished = true;
                    log::info!(
                        "{} ----/{}, done at {}",
                        self.desc,
                        self.len,
                        Local::now().format("%Y-%m-%d %H:%M:%S")
                    );
                }
                None
            }
        }
    }

    fn size_hint(&self) -> (usize, Option<usize>) {
        self.inner.size_hint()
    }
}

pub fn format_duration(duration: Duration) -> String {
    let secs = duration.as_secs();
    format!("{}:{:02}:{:02}", secs / 3600, (secs / 60) % 60, secs % 60)
}
