use edfplus_engine::filter::{self, DueFilter, Filter, SeFilter};
use edfplus_engine::{Direction, EdfError};
use std::f64::consts::PI;

// 测试用输入：两个正弦叠加一个直流偏移
fn test_signal(len: usize, fs: f64) -> Vec<f64> {
    (0..len)
        .map(|n| {
            let t = n as f64 / fs;
            3.0 + (2.0 * PI * 2.0 * t).sin() + 0.5 * (2.0 * PI * 50.0 * t).sin()
        })
        .collect()
}

fn run(filter: &mut dyn Filter, input: &[f64]) -> Vec<f64> {
    let mut output = vec![0.0; input.len()];
    filter.filter_samples(input, &mut output, 0, input.len() - 1, 0).unwrap();
    output
}

fn assert_close(a: &[f64], b: &[f64], tolerance: f64) {
    assert_eq!(a.len(), b.len());
    for (i, (x, y)) in a.iter().zip(b).enumerate() {
        assert!((x - y).abs() <= tolerance, "sample {}: {} vs {}", i, x, y);
    }
}

fn make(kind: usize) -> Box<dyn Filter> {
    match kind {
        0 => Box::new(DueFilter::new(256.0, 0.5)),
        _ => Box::new(SeFilter::new(256.0, 30.0, 50.0, 5.0)),
    }
}

// 每种滤波器两个相同设置的实例
fn filters() -> Vec<(Box<dyn Filter>, Box<dyn Filter>)> {
    (0..2).map(|kind| (make(kind), make(kind))).collect()
}

#[test]
fn test_saved_state_continues_filtering() {
    let input = test_signal(64, 256.0);
    for kind in 0..2 {
        let expected = run(make(kind).as_mut(), &input);

        for split in 1..input.len() {
            let mut first = make(kind);
            let mut second = make(kind);
            let mut output = vec![0.0; input.len()];
            first.filter_samples(&input, &mut output, 0, split - 1, 0).unwrap();

            // 新滤波器先计算系数，再恢复状态
            second.reset().unwrap();
            second.restore_state(&first.save_state()).unwrap();
            second.filter_samples(&input, &mut output, split, input.len() - 1, split).unwrap();

            assert_close(&output, &expected, 1e-9);
        }
    }
}

#[test]
fn test_se_steady_state_after_reset_to() {
    let mut se = SeFilter::new(256.0, 30.0, 50.0, 5.0);
    se.reset_to(2.5).unwrap();
    let output = run(&mut se, &[2.5; 50]);
    assert_close(&output, &[2.5; 50], 1e-9);

    // 增益同样作用于直流
    se.settings_mut().set_number(filter::GAIN_SLOT, 2.0);
    se.reset_to(1.5).unwrap();
    let output = run(&mut se, &[1.5; 20]);
    assert_close(&output, &[3.0; 20], 1e-9);
}

#[test]
fn test_reset_on_next_sample_starts_settled() {
    let mut se = SeFilter::new(256.0, 30.0, 50.0, 5.0);
    run(&mut se, &test_signal(32, 256.0));

    se.reset_on_next_sample();
    let output = run(&mut se, &[-4.0; 10]);
    assert_close(&output, &[-4.0; 10], 1e-9);
}

#[test]
fn test_due_cutoff_validation() {
    // 默认采样频率 100 Hz
    let cases = [("DUE(1/-1)", Some(3)), ("DUE(1/60)", Some(3)), ("DUE(1/10)", None), ("DUE(1/50)", None)];
    for (text, expected) in cases {
        let due = filter::parse_filter(text).unwrap();
        assert_eq!(due.check_settings(), expected, "{}", text);
    }

    let mut due = filter::parse_filter("DUE(1/60)").unwrap();
    let mut data = vec![1.0; 8];
    assert!(matches!(
        due.filter_in_place(&mut data, 0, 7),
        Err(EdfError::FilterSetting { slot: 3, .. })
    ));
    assert_eq!(data, vec![1.0; 8]);
}

#[test]
fn test_reverse_direction_mirrors_forward() {
    let input = test_signal(128, 256.0);
    for (mut forward, mut backward) in filters() {
        let expected = run(forward.as_mut(), &input);

        let reversed: Vec<f64> = input.iter().rev().copied().collect();
        backward.set_direction(Direction::Reverse);
        assert_eq!(backward.direction(), Direction::Reverse);
        let mut output = run(backward.as_mut(), &reversed);
        output.reverse();

        assert_close(&output, &expected, 1e-9);
    }
}

#[test]
fn test_in_place_matches_separate_output() {
    let input = test_signal(100, 256.0);
    for (mut separate, mut in_place) in filters() {
        let expected = run(separate.as_mut(), &input);

        let mut data = input.clone();
        in_place.filter_in_place(&mut data, 0, 49).unwrap();
        in_place.filter_in_place(&mut data, 50, 99).unwrap();
        assert_close(&data, &expected, 1e-12);
    }
}

#[test]
fn test_settings_change_recomputes_coefficients() {
    let mut se = filter::parse_filter("SE(1/30/50/5)").unwrap();
    se.settings_mut().set_number(filter::SAMPLE_FREQUENCY_SLOT, 256.0);
    se.reset().unwrap();
    let before = se.core().poles().to_vec();
    assert!(!se.settings().is_stale());

    assert!(se.settings_mut().set_number(3, 10.0));
    assert!(se.settings().is_stale());
    run(se.as_mut(), &[0.0; 4]);
    assert!(!se.settings().is_stale());
    assert_ne!(se.core().poles(), &before[..]);
    assert_eq!(filter::describe(se.as_ref()), "SE(1/10/50/5)");

    // 只读的描述字段不能修改
    assert!(!se.settings_mut().set_text(filter::DESCRIPTION_SLOT, "other"));
    assert_eq!(se.settings().description(), "SE");
}
