//! Property tests for run duration and the counts derived from it.

use proptest::prelude::*;
use run_daq::timing::{truncated_count, RunParameters};

fn timed_params() -> impl Strategy<Value = RunParameters> {
    (
        0.0f64..120.0,
        any::<bool>(),
        0.001f64..0.5,
        0.001f64..0.5,
        1u64..200,
        0.0f64..120.0,
        prop::sample::select(vec![10.0, 20.0, 25.0, 30.0, 50.0, 100.0]),
    )
        .prop_map(
            |(baseline, stimulation, high, low, pulses, post, master)| RunParameters {
                master_frequency: master,
                baseline_delay: baseline,
                stimulation_enabled: stimulation,
                stimulation_high_time: high,
                stimulation_low_time: low,
                stimulation_pulse_count: pulses,
                post_stimulation_duration: post,
                ..RunParameters::default()
            },
        )
}

proptest! {
    #[test]
    fn total_duration_adds_up(params in timed_params()) {
        let expected = if params.stimulation_enabled {
            params.baseline_delay
                + params.stimulation_pulse_count as f64
                    * (params.stimulation_high_time + params.stimulation_low_time)
                + params.post_stimulation_duration
        } else {
            params.baseline_delay
        };
        prop_assert!((params.total_duration() - expected).abs() < 1e-9);
    }

    #[test]
    fn master_pulses_never_exceed_the_duration(params in timed_params()) {
        let pulses = params.master_pulse_count();
        let covered = pulses as f64 / params.master_frequency;
        prop_assert!(covered <= params.total_duration() + 1e-6);
        prop_assert!(covered + 1.0 / params.master_frequency > params.total_duration() - 1e-6);
    }

    #[test]
    fn truncation_is_monotonic(duration in 0.0f64..1000.0, extra in 0.0f64..10.0, rate in 1.0f64..20_000.0) {
        prop_assert!(truncated_count(duration, rate) <= truncated_count(duration + extra, rate));
    }
}

