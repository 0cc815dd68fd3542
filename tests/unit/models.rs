//! Unit tests for instrument and timeframe parsing

use tickflow::models::{Instrument, Timeframe};
use tickflow::SignalError;

#[test]
fn timeframe_parses_shorthand() {
    assert_eq!(
        Timeframe::parse("30s").unwrap().as_duration().as_secs(),
        30
    );
    assert_eq!(Timeframe::parse("1m").unwrap().as_duration().as_secs(), 60);
    assert_eq!(
        Timeframe::parse("2h").unwrap().as_duration().as_secs(),
        7200
    );
}

#[test]
fn timeframe_rejects_garbage() {
    for input in ["", "m", "5x", "abc", "-1m"] {
        assert!(
            matches!(Timeframe::parse(input), Err(SignalError::InvalidConfig(_))),
            "expected InvalidConfig for {:?}",
            input
        );
    }
}

#[test]
fn timeframe_rejects_zero() {
    assert!(matches!(
        Timeframe::parse("0m"),
        Err(SignalError::InvalidConfig(_))
    ));
}

#[test]
fn timeframe_display_round_trips() {
    for input in ["45s", "5m", "1h"] {
        let tf = Timeframe::parse(input).unwrap();
        assert_eq!(tf.to_string(), input);
    }
}

#[test]
fn instrument_display_includes_timeframe() {
    let instrument = Instrument::new("frxEURUSD", Timeframe::parse("1m").unwrap());
    assert_eq!(instrument.to_string(), "frxEURUSD/1m");
}
