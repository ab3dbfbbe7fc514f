mod common;

use common::{cpus, gpus, init_logging, isolated, reference, sizes_from_cuts};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use stencil_rs::{
    HostDevice, HostDeviceConfig, PartitionedVector, Stencil, StencilError, Strategy, StrategyPolicy,
};

const SECOND_DIFF: [f64; 3] = [1.0, -2.0, 1.0];
const SQUARES: [f64; 5] = [0.0, 1.0, 4.0, 9.0, 16.0];

fn random_vec(rng: &mut StdRng, len: usize) -> Vec<f64> {
    (0..len).map(|_| rng.random_range(-9..=9) as f64).collect()
}

#[test]
fn test_second_difference_of_squares() {
    init_logging();
    for ndev in [1, 2, 3, 5] {
        let devices = gpus(ndev);
        let s = Stencil::with_config(&devices, &SECOND_DIFF, 1, isolated()).unwrap();
        let x = PartitionedVector::from_slice(&devices, &SQUARES).unwrap();
        let mut y = PartitionedVector::zeros_like(&x).unwrap();
        s.convolve(&x, &mut y, 0.0, 1.0).unwrap();
        assert_eq!(
            y.to_vec().unwrap(),
            vec![1.0, 2.0, 2.0, 2.0, -7.0],
            "{} devices",
            ndev
        );
    }
}

#[test]
fn test_split_invariance_with_explicit_partitions() {
    let mut rng = StdRng::seed_from_u64(7);
    let coeffs = [1.0, -3.0, 2.0, 5.0, -1.0, 4.0];
    let x = random_vec(&mut rng, 23);
    let expected = reference(&coeffs, 2, &x, &[0.0; 23], 0.0, 1.0);

    let layouts: [&[usize]; 5] = [
        &[23],
        &[11, 12],
        &[1, 1, 21],
        &[0, 20, 0, 3],
        &[2, 0, 1, 19, 1],
    ];
    for sizes in layouts {
        let devices = gpus(sizes.len());
        let s = Stencil::with_config(&devices, &coeffs, 2, isolated()).unwrap();
        let x = PartitionedVector::from_slice_with_sizes(&devices, &x, sizes).unwrap();
        let mut y = PartitionedVector::zeros_like(&x).unwrap();
        s.convolve(&x, &mut y, 0.0, 1.0).unwrap();
        assert_eq!(y.to_vec().unwrap(), expected, "partition sizes {:?}", sizes);
    }
}

#[test]
fn test_random_partitions_match_reference() {
    let mut rng = StdRng::seed_from_u64(2024);
    for round in 0..20 {
        let len = rng.random_range(1..60);
        let width = rng.random_range(1..9);
        let center = rng.random_range(0..width);
        let ndev = rng.random_range(1..5);
        let cuts: Vec<usize> = (0..ndev - 1).map(|_| rng.random_range(0..=len)).collect();
        let sizes = sizes_from_cuts(len, &cuts);

        let coeffs = random_vec(&mut rng, width);
        let host_x = random_vec(&mut rng, len);
        let host_y = random_vec(&mut rng, len);
        let expected = reference(&coeffs, center, &host_x, &host_y, 2.0, -3.0);

        let devices = gpus(ndev);
        let s = Stencil::with_config(&devices, &coeffs, center, isolated()).unwrap();
        let x = PartitionedVector::from_slice_with_sizes(&devices, &host_x, &sizes).unwrap();
        let mut y = PartitionedVector::from_slice_with_sizes(&devices, &host_y, &sizes).unwrap();
        s.convolve(&x, &mut y, 2.0, -3.0).unwrap();
        assert_eq!(
            y.to_vec().unwrap(),
            expected,
            "round {}: width {}, center {}, sizes {:?}",
            round,
            width,
            center,
            sizes
        );
    }
}

#[test]
fn test_overwrite_ignores_previous_output() {
    let devices = gpus(2);
    let s = Stencil::with_config(&devices, &SECOND_DIFF, 1, isolated()).unwrap();
    let x = PartitionedVector::from_slice(&devices, &SQUARES).unwrap();
    let mut y = PartitionedVector::from_slice(&devices, &[f64::NAN; 5]).unwrap();
    s.convolve(&x, &mut y, 0.0, 2.0).unwrap();
    assert_eq!(y.to_vec().unwrap(), vec![2.0, 4.0, 4.0, 4.0, -14.0]);
}

#[test]
fn test_accumulate_into_previous_output() {
    let devices = gpus(3);
    let s = Stencil::with_config(&devices, &SECOND_DIFF, 1, isolated()).unwrap();
    let x = PartitionedVector::from_slice(&devices, &SQUARES).unwrap();
    let mut y = PartitionedVector::from_slice(&devices, &[1.0, 2.0, 3.0, 4.0, 5.0]).unwrap();
    s.convolve(&x, &mut y, 0.5, 1.0).unwrap();
    assert_eq!(y.to_vec().unwrap(), vec![1.5, 3.0, 3.5, 4.0, -4.5]);
}

#[test]
fn test_repeated_calls_are_deterministic() {
    let mut rng = StdRng::seed_from_u64(11);
    let devices = gpus(4);
    let coeffs = random_vec(&mut rng, 7);
    let s = Stencil::with_config(&devices, &coeffs, 3, isolated()).unwrap();
    let x = PartitionedVector::from_slice(&devices, &random_vec(&mut rng, 50)).unwrap();

    let first = (&s * &x).eval().unwrap().to_vec().unwrap();
    for _ in 0..5 {
        let again = (&s * &x).eval().unwrap().to_vec().unwrap();
        assert_eq!(again, first);
    }
}

#[test]
fn test_generic_and_tiled_agree() {
    let mut rng = StdRng::seed_from_u64(99);
    let coeffs = random_vec(&mut rng, 9);
    let host_x = random_vec(&mut rng, 70);
    let devices = gpus(3);
    let x = PartitionedVector::from_slice(&devices, &host_x).unwrap();

    let generic = Stencil::with_config(
        &devices,
        &coeffs,
        6,
        isolated().with_policy(StrategyPolicy::Force(Strategy::Generic)),
    )
    .unwrap();
    let tiled = Stencil::with_config(
        &devices,
        &coeffs,
        6,
        isolated().with_policy(StrategyPolicy::Force(Strategy::Tiled)),
    )
    .unwrap();
    assert_eq!(generic.strategy(0), Strategy::Generic);
    assert_eq!(tiled.strategy(0), Strategy::Tiled);

    let a = (&generic * &x).eval().unwrap().to_vec().unwrap();
    let b = (&tiled * &x).eval().unwrap().to_vec().unwrap();
    assert_eq!(a, b);
    assert_eq!(a, reference(&coeffs, 6, &host_x, &host_x, 0.0, 1.0));
}

#[test]
fn test_width_one_is_pointwise_scale() {
    let devices = gpus(2);
    let s = Stencil::with_config(&devices, &[3.0], 0, isolated()).unwrap();
    assert_eq!((s.lhalo(), s.rhalo()), (0, 0));
    let x = PartitionedVector::from_slice(&devices, &[1.0, -2.0, 5.0]).unwrap();
    let mut y = PartitionedVector::from_slice(&devices, &[1.0, 1.0, 1.0]).unwrap();
    s.convolve(&x, &mut y, 1.0, 2.0).unwrap();
    assert_eq!(y.to_vec().unwrap(), vec![7.0, -11.0, 31.0]);
}

#[test]
fn test_wide_stencil_falls_back_to_generic() {
    let mut rng = StdRng::seed_from_u64(5);
    let coeffs = random_vec(&mut rng, 65);
    let host_x = random_vec(&mut rng, 100);
    let devices = gpus(2);
    let s = Stencil::with_config(&devices, &coeffs, 30, isolated()).unwrap();
    assert!((0..2).all(|d| s.strategy(d) == Strategy::Generic));

    let x = PartitionedVector::from_slice(&devices, &host_x).unwrap();
    let y = (&s * &x).eval().unwrap();
    assert_eq!(
        y.to_vec().unwrap(),
        reference(&coeffs, 30, &host_x, &host_x, 0.0, 1.0)
    );
}

#[test]
fn test_cpu_devices_use_generic_strategy() {
    let devices = cpus(2);
    let s = Stencil::with_config(&devices, &SECOND_DIFF, 1, isolated()).unwrap();
    assert_eq!(s.strategy(0), Strategy::Generic);
    assert_eq!(s.strategy(1), Strategy::Generic);

    let x = PartitionedVector::from_slice(&devices, &SQUARES).unwrap();
    let y = (&x * &s).eval().unwrap();
    assert_eq!(y.to_vec().unwrap(), vec![1.0, 2.0, 2.0, 2.0, -7.0]);
}

#[test]
fn test_generic_strategy_runs_without_local_memory() {
    let devices = HostDevice::many(2, HostDeviceConfig::cpu().with_local_mem_size(0)).unwrap();
    let s = Stencil::with_config(&devices, &SECOND_DIFF, 1, isolated()).unwrap();
    assert_eq!(s.strategy(0), Strategy::Generic);

    let x = PartitionedVector::from_slice(&devices, &SQUARES).unwrap();
    let y = (&s * &x).eval().unwrap();
    assert_eq!(y.to_vec().unwrap(), vec![1.0, 2.0, 2.0, 2.0, -7.0]);
}

#[test]
fn test_single_precision_and_integers() {
    let devices = gpus(2);
    let s = Stencil::with_config(&devices, &[1.0f32, -1.0], 0, isolated()).unwrap();
    let x = PartitionedVector::from_slice(&devices, &[1.0f32, 3.0, 6.0, 10.0]).unwrap();
    assert_eq!(
        (&s * &x).eval().unwrap().to_vec().unwrap(),
        vec![-2.0, -3.0, -4.0, 0.0]
    );

    let s = Stencil::with_config(&devices, &[1i64, 1, 1], 1, isolated()).unwrap();
    let x = PartitionedVector::from_slice(&devices, &[1i64, 2, 3, 4]).unwrap();
    assert_eq!(
        (&s * &x).eval().unwrap().to_vec().unwrap(),
        vec![4, 6, 9, 11]
    );
}

#[test]
fn test_mismatched_output_layout_is_rejected() {
    let devices = gpus(2);
    let s = Stencil::with_config(&devices, &SECOND_DIFF, 1, isolated()).unwrap();
    let x = PartitionedVector::from_slice(&devices, &SQUARES).unwrap();
    let mut y = PartitionedVector::zeros_with_sizes(&devices, &[4, 1]).unwrap();
    assert!(matches!(
        s.convolve(&x, &mut y, 0.0, 1.0),
        Err(StencilError::LayoutMismatch(_))
    ));
}

#[test]
fn test_concurrent_calls_are_serialised() {
    let devices = gpus(3);
    let s = Stencil::with_config(&devices, &SECOND_DIFF, 1, isolated()).unwrap();
    let x = PartitionedVector::from_slice(&devices, &SQUARES).unwrap();

    std::thread::scope(|scope| {
        for _ in 0..4 {
            scope.spawn(|| {
                for _ in 0..10 {
                    let y = (&s * &x).eval().unwrap();
                    assert_eq!(y.to_vec().unwrap(), vec![1.0, 2.0, 2.0, 2.0, -7.0]);
                }
            });
        }
    });
}
