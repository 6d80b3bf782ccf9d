//! Operational counters exposed at `/metrics` in Prometheus text format.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;

#[derive(Default)]
pub struct Metrics {
    failed_requests: AtomicU64,
    process_time_ms_sum: AtomicU64,
    process_time_count: AtomicU64,
    output_chars_sum: AtomicU64,
    output_chars_count: AtomicU64,
    /// Characters per second of the most recent request, scaled by 1000.
    last_throughput_millis: AtomicU64,
    busy: AtomicBool,
}

impl Metrics {
    pub fn record_failure(&self) {
        self.failed_requests.fetch_add(1, Ordering::Relaxed);
    }

    pub fn set_busy(&self, busy: bool) {
        self.busy.store(busy, Ordering::Relaxed);
    }

    /// Observe one finished request.
    pub fn observe(&self, duration: Duration, output_chars: u64) {
        let millis = duration.as_millis() as u64;
        if millis == 0 {
            return;
        }
        self.process_time_ms_sum.fetch_add(millis, Ordering::Relaxed);
        self.process_time_count.fetch_add(1, Ordering::Relaxed);
        self.output_chars_sum
            .fetch_add(output_chars, Ordering::Relaxed);
        self.output_chars_count.fetch_add(1, Ordering::Relaxed);
        let throughput_millis = output_chars.saturating_mul(1_000_000) / millis;
        self.last_throughput_millis
            .store(throughput_millis, Ordering::Relaxed);
    }

    pub fn render(&self) -> String {
        let time_sum = self.process_time_ms_sum.load(Ordering::Relaxed) as f64 / 1000.0;
        let throughput = self.last_throughput_millis.load(Ordering::Relaxed) as f64 / 1000.0;
        format!(
            concat!(
                "# TYPE relay_failed_requests_total counter\n",
                "relay_failed_requests_total {}\n",
                "# TYPE relay_process_time_seconds summary\n",
                "relay_process_time_seconds_sum {}\n",
                "relay_process_time_seconds_count {}\n",
                "# TYPE relay_output_chars summary\n",
                "relay_output_chars_sum {}\n",
                "relay_output_chars_count {}\n",
                "# TYPE relay_throughput_chars_per_second gauge\n",
                "relay_throughput_chars_per_second {}\n",
                "# TYPE relay_busy gauge\n",
                "relay_busy {}\n",
            ),
            self.failed_requests.load(Ordering::Relaxed),
            time_sum,
            self.process_time_count.load(Ordering::Relaxed),
            self.output_chars_sum.load(Ordering::Relaxed),
            self.output_chars_count.load(Ordering::Relaxed),
            throughput,
            self.busy.load(Ordering::Relaxed) as u8,
        )
    }
}
