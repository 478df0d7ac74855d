//! Integration tests for noise schedules and the sampler built on them

use ndarray::Axis;

use nasdiff::config::Config;
use nasdiff::data::{aug_mask, cell_adjacency, AugMaskAlgo, DataScaler};
use nasdiff::error::NasDiffError;
use nasdiff::models::GraphLinearScore;
use nasdiff::sampling::get_sampling_fn;
use nasdiff::sde::{build_sde, SdeKind};
use nasdiff::utils::RandomSource;

#[test]
fn test_vp_schedule_end_to_end() {
    let mut config = Config::scorenet().with_sde("vpsde");
    config.model.beta_min = 0.1;
    config.model.beta_max = 20.0;
    config.model.num_scales = 1000;
    let (sde, eps) = build_sde(&config).unwrap();
    assert_eq!(sde.kind(), SdeKind::Vp);
    assert_eq!(eps, 1e-3);
    assert_eq!(sde.num_steps(), 1000);
}

#[test]
fn test_ve_schedule_eps() {
    let (sde, eps) = build_sde(&Config::scorenet().with_sde("VESDE")).unwrap();
    assert_eq!(sde.kind(), SdeKind::Ve);
    assert_eq!(eps, 1e-5);
}

#[test]
fn test_unsupported_schedule() {
    for kind in ["subvpsde", "", "vp"] {
        let err = build_sde(&Config::scorenet().with_sde(kind)).unwrap_err();
        assert!(matches!(err, NasDiffError::UnsupportedSde(_)));
        assert!(err.is_config_error());
    }
}

#[test]
fn test_sampler_is_deterministic_for_a_seed() {
    let mut config = Config::scorenet();
    config.model.num_scales = 15;
    let (sde, eps) = build_sde(&config).unwrap();
    let sampling_fn = get_sampling_fn(&config, sde, (4, 8, 7), DataScaler::new(true), eps).unwrap();
    let mask = aug_mask(&cell_adjacency().insert_axis(Axis(0)), AugMaskAlgo::Floyd);
    let model = GraphLinearScore::new(7, 8, 0.05, &mut RandomSource::new(1));

    let a = sampling_fn.sample(&model, &mask, &mut RandomSource::new(9)).unwrap();
    let b = sampling_fn.sample(&model, &mask, &mut RandomSource::new(9)).unwrap();
    assert_eq!(a.samples, b.samples);
    assert_eq!(a.n_steps, 15);
}
