//! Property tests: a convolution does not depend on how the vector is split.

mod common;

use common::{gpus, isolated, reference, sizes_from_cuts};
use proptest::prelude::*;
use stencil_rs::{PartitionedVector, Stencil, Strategy as Kernel, StrategyPolicy};

fn small_ints(len: std::ops::Range<usize>) -> impl Strategy<Value = Vec<f64>> {
    prop::collection::vec((-9i32..=9).prop_map(f64::from), len)
}

/// Coefficients with a centre inside them.
fn arb_stencil() -> impl Strategy<Value = (Vec<f64>, usize)> {
    small_ints(1..12).prop_flat_map(|coeffs| {
        let width = coeffs.len();
        (Just(coeffs), 0..width)
    })
}

/// A vector and partition sizes over 1 to 5 devices.
fn arb_layout() -> impl Strategy<Value = (Vec<f64>, Vec<usize>)> {
    small_ints(1..80).prop_flat_map(|x| {
        let len = x.len();
        let cuts = prop::collection::vec(0..=len, 0..5);
        (Just(x), cuts.prop_map(move |cuts| sizes_from_cuts(len, &cuts)))
    })
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(32))]

    #[test]
    fn prop_matches_single_device_reference(
        (coeffs, center) in arb_stencil(),
        (host_x, sizes) in arb_layout(),
        alpha in -2i32..=2,
        beta in -2i32..=2,
    ) {
        let (alpha, beta) = (f64::from(alpha), f64::from(beta));
        let host_y: Vec<f64> = host_x.iter().rev().copied().collect();
        let expected = reference(&coeffs, center, &host_x, &host_y, alpha, beta);

        let devices = gpus(sizes.len());
        let s = Stencil::with_config(&devices, &coeffs, center, isolated()).unwrap();
        let x = PartitionedVector::from_slice_with_sizes(&devices, &host_x, &sizes).unwrap();
        let mut y = PartitionedVector::from_slice_with_sizes(&devices, &host_y, &sizes).unwrap();
        s.convolve(&x, &mut y, alpha, beta).unwrap();

        prop_assert_eq!(y.to_vec().unwrap(), expected);
    }

    #[test]
    fn prop_strategies_agree(
        (coeffs, center) in arb_stencil(),
        (host_x, sizes) in arb_layout(),
    ) {
        let devices = gpus(sizes.len());
        let x = PartitionedVector::from_slice_with_sizes(&devices, &host_x, &sizes).unwrap();

        let mut outputs = Vec::new();
        for strategy in [Kernel::Generic, Kernel::Tiled] {
            let config = isolated().with_policy(StrategyPolicy::Force(strategy));
            let s = Stencil::with_config(&devices, &coeffs, center, config).unwrap();
            outputs.push((&s * &x).eval().unwrap().to_vec().unwrap());
        }

        prop_assert_eq!(&outputs[0], &outputs[1]);
    }
}
