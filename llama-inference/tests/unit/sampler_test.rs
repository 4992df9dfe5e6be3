use super::*;

#[test]
fn zero_temperature_is_argmax() {
    let mut rng = Rng::new(1234);
    let logits = [-2.0, 2.0, 0.5];
    // the penalty path is skipped entirely in the greedy case
    let id = sample_top_p_top_k(&logits, &[0, 1, 2], 40, 0.95, 0.0, 10.0, &mut rng);
    assert_eq!(id, 1);
}

#[test]
fn negative_temperature_is_argmax_too() {
    let mut rng = Rng::new(1);
    let id = sample_top_p_top_k(&[0.1, 0.9, 0.3], &[], 0, 1.0, -1.0, 1.0, &mut rng);
    assert_eq!(id, 1);
}

#[test]
fn penalty_scales_negative_logits_away_from_zero() {
    // Scenario: logits [-2, +2], id 0 was seen, temp 1, penalty 2.
    // id 0 scales to -4 and id 1 stays at +2, so with top_k = 1 the single
    // surviving candidate must be id 1.
    let mut rng = Rng::new(7);
    let id = sample_top_p_top_k(&[-2.0, 2.0], &[0], 1, 1.0, 1.0, 2.0, &mut rng);
    assert_eq!(id, 1);
}

#[test]
fn penalty_divides_positive_logits() {
    // Both logits positive; penalizing the larger one reorders the pair.
    let mut rng = Rng::new(7);
    let id = sample_top_p_top_k(&[0.5, 1.0], &[1], 1, 1.0, 1.0, 4.0, &mut rng);
    assert_eq!(id, 0);
}

#[test]
fn top_k_one_is_greedy() {
    let mut rng = Rng::new(99);
    for _ in 0..16 {
        let id = sample_top_p_top_k(&[0.0, 3.0, 1.0, 2.0], &[], 1, 1.0, 0.7, 1.0, &mut rng);
        assert_eq!(id, 1);
    }
}

#[test]
fn tiny_top_p_keeps_only_the_head_of_the_distribution() {
    // The most likely token alone already exceeds top_p, so the draw can
    // never land elsewhere.
    let mut rng = Rng::new(3);
    for _ in 0..32 {
        let id = sample_top_p_top_k(&[8.0, 0.0, 0.0, 0.0], &[], 0, 0.1, 1.0, 1.0, &mut rng);
        assert_eq!(id, 0);
    }
}

#[test]
fn non_positive_top_k_keeps_all_candidates() {
    // With a flat distribution and top_k disabled every id must be reachable.
    let mut rng = Rng::new(5);
    let mut seen = [false; 4];
    for _ in 0..256 {
        let id = sample_top_p_top_k(&[1.0, 1.0, 1.0, 1.0], &[], 0, 1.0, 1.0, 1.0, &mut rng);
        seen[id as usize] = true;
    }
    assert!(seen.iter().all(|&s| s));
}

#[test]
fn same_seed_draws_the_same_sequence() {
    let logits = [0.1, 0.4, 0.3, 0.2, 0.8];
    let mut a = Rng::new(42);
    let mut b = Rng::new(42);
    for _ in 0..64 {
        let ta = sample_top_p_top_k(&logits, &[], 3, 0.9, 0.8, 1.1, &mut a);
        let tb = sample_top_p_top_k(&logits, &[], 3, 0.9, 0.8, 1.1, &mut b);
        assert_eq!(ta, tb);
    }
}

#[test]
fn rng_state_round_trips() {
    let mut a = Rng::new(1337);
    a.next_f32();
    let snapshot = a.state();

    let mut b = Rng::new(1);
    b.set_state(snapshot);
    assert_eq!(a.next_f32(), b.next_f32());
    assert_eq!(a.next_f32(), b.next_f32());
}

#[test]
fn zero_seed_is_remapped_off_the_fixed_point() {
    let mut rng = Rng::new(0);
    assert_ne!(rng.state(), 0);
    // a zero state would never leave zero
    assert_ne!(rng.next_f32(), rng.next_f32());
}
