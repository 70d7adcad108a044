//! Candidate transform engine.
//!
//! Pure numeric conversions between raw acceleration-search output and
//! fold-ready parameters. Accelerated searches report barycentred-epoch
//! periods; folding needs them referenced to the midpoint of the
//! observation, hence the half-epoch drift correction applied here.

use crate::error::PipelineError;
use crate::types::AccelerationRange;

/// Speed of light in m/s.
pub const SPEED_OF_LIGHT_M_S: f64 = 2.997_924_58e8;

/// Solar mass in time units (G * M_sun / c^3), seconds.
pub const T_SUN_S: f64 = 4.925e-6;

/// Spin-period derivative induced by a constant line-of-sight acceleration.
///
/// `pdot = P * a / c`. An acceleration of zero is valid (pdot = 0); a spin
/// period of zero is not.
pub fn period_derivative(period_s: f64, acceleration_ms2: f64) -> Result<f64, PipelineError> {
    if !period_s.is_finite() || period_s <= 0.0 {
        return Err(PipelineError::InvalidParameter(format!(
            "spin period must be finite and positive, got {period_s}"
        )));
    }
    if !acceleration_ms2.is_finite() {
        return Err(PipelineError::InvalidParameter(format!(
            "acceleration must be finite, got {acceleration_ms2}"
        )));
    }
    Ok(period_s * acceleration_ms2 / SPEED_OF_LIGHT_M_S)
}

/// Reference a reported period to the midpoint of the observation.
///
/// Subtracts the drift accumulated over half the correction window:
/// `P - pdot * window * tsamp / 2`. The window is the FFT length when one
/// was set, otherwise `2^(bit_length(sample_count) - 1)`.
pub fn midpoint_adjusted_period(
    period_s: f64,
    pdot: f64,
    sample_count: u64,
    sampling_interval_s: f64,
    fft_size: u64,
) -> Result<f64, PipelineError> {
    if !period_s.is_finite() || !pdot.is_finite() {
        return Err(PipelineError::InvalidParameter(format!(
            "period/pdot must be finite, got {period_s}/{pdot}"
        )));
    }
    if !sampling_interval_s.is_finite() || sampling_interval_s < 0.0 {
        return Err(PipelineError::InvalidParameter(format!(
            "sampling interval must be finite and non-negative, got {sampling_interval_s}"
        )));
    }
    let window = if fft_size == 0 {
        if sample_count == 0 {
            return Err(PipelineError::InvalidParameter(
                "correction window undefined for zero samples and no FFT size".to_string(),
            ));
        }
        1u64 << (bit_length(sample_count) - 1)
    } else {
        fft_size
    };
    Ok(period_s - pdot * window as f64 * sampling_interval_s / 2.0)
}

/// Maximum line-of-sight acceleration from Keplerian mass-function limits.
///
/// For a circular orbit of the given period (hours) and companion mass
/// (solar masses): `amax = (2π/P_orb)^(4/3) * (T_sun * f(m))^(1/3) * c`,
/// with `f(m) = mc³ / (mp + mc)²`. Returns the symmetric search range
/// `[-amax, +amax]`.
pub fn max_acceleration_from_orbit(
    orbital_period_hours: f64,
    companion_mass: f64,
    pulsar_mass: f64,
) -> Result<AccelerationRange, PipelineError> {
    if !orbital_period_hours.is_finite() || orbital_period_hours <= 0.0 {
        return Err(PipelineError::InvalidParameter(format!(
            "orbital period must be finite and positive, got {orbital_period_hours}"
        )));
    }
    if !companion_mass.is_finite() || companion_mass <= 0.0 {
        return Err(PipelineError::InvalidParameter(format!(
            "companion mass must be finite and positive, got {companion_mass}"
        )));
    }
    if !pulsar_mass.is_finite() || pulsar_mass <= 0.0 {
        return Err(PipelineError::InvalidParameter(format!(
            "pulsar mass must be finite and positive, got {pulsar_mass}"
        )));
    }
    let mass_function = companion_mass.powi(3) / (pulsar_mass + companion_mass).powi(2);
    let orbital_period_s = orbital_period_hours * 3600.0;
    let amax = (2.0 * std::f64::consts::PI / orbital_period_s).powf(4.0 / 3.0)
        * (T_SUN_S * mass_function).powf(1.0 / 3.0)
        * SPEED_OF_LIGHT_M_S;
    Ok(AccelerationRange {
        start: -amax,
        end: amax,
    })
}

/// FFT length for a search over `sample_count` samples.
///
/// Smallest power of two >= the sample count, except when the count is
/// already an exact power of two, in which case it is used unchanged
/// (avoids doubling the FFT length on an exact boundary).
pub fn next_power_of_two_fft_size(sample_count: u64) -> Result<u64, PipelineError> {
    if sample_count == 0 {
        return Err(PipelineError::InvalidParameter(
            "FFT size undefined for zero samples".to_string(),
        ));
    }
    if sample_count.is_power_of_two() {
        Ok(sample_count)
    } else {
        Ok(sample_count.next_power_of_two())
    }
}

fn bit_length(n: u64) -> u32 {
    64 - n.leading_zeros()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pdot_matches_reference_values() {
        let pdot = period_derivative(0.01, 10.0).unwrap();
        assert!((pdot - 0.01 * 10.0 / SPEED_OF_LIGHT_M_S).abs() < 1e-18);
        // Order of magnitude sanity: ~3.34e-10 for these inputs.
        assert!(pdot > 3.3e-10 && pdot < 3.4e-10);
    }

    #[test]
    fn pdot_sign_follows_acceleration() {
        assert!(period_derivative(0.5, 25.0).unwrap() > 0.0);
        assert!(period_derivative(0.5, -25.0).unwrap() < 0.0);
        assert_eq!(period_derivative(0.5, 0.0).unwrap(), 0.0);
    }

    #[test]
    fn pdot_rejects_zero_period() {
        assert!(matches!(
            period_derivative(0.0, 10.0),
            Err(PipelineError::InvalidParameter(_))
        ));
    }

    #[test]
    fn adjusted_period_direction_tracks_acceleration_sign() {
        let samples = 1u64 << 20;
        let tsamp = 6.4e-5;

        let pdot_pos = period_derivative(0.01, 10.0).unwrap();
        let adjusted = midpoint_adjusted_period(0.01, pdot_pos, samples, tsamp, 0).unwrap();
        assert!(adjusted < 0.01);

        let pdot_neg = period_derivative(0.01, -10.0).unwrap();
        let adjusted = midpoint_adjusted_period(0.01, pdot_neg, samples, tsamp, 0).unwrap();
        assert!(adjusted > 0.01);

        let adjusted = midpoint_adjusted_period(0.01, 0.0, samples, tsamp, 0).unwrap();
        assert_eq!(adjusted, 0.01);
    }

    #[test]
    fn zero_fft_size_window_uses_sample_bit_length() {
        // With 2^20 samples the implied window is exactly 2^20, so the
        // zero-FFT path and an explicit 2^20 FFT must agree.
        let samples = 1u64 << 20;
        let pdot = period_derivative(0.01, 10.0).unwrap();
        let implicit = midpoint_adjusted_period(0.01, pdot, samples, 6.4e-5, 0).unwrap();
        let explicit = midpoint_adjusted_period(0.01, pdot, samples, 6.4e-5, samples).unwrap();
        assert_eq!(implicit, explicit);
    }

    #[test]
    fn window_rejects_zero_samples_without_fft_size() {
        let err = midpoint_adjusted_period(0.01, 1e-10, 0, 6.4e-5, 0);
        assert!(matches!(err, Err(PipelineError::InvalidParameter(_))));
        // An explicit FFT size makes zero samples irrelevant.
        assert!(midpoint_adjusted_period(0.01, 1e-10, 0, 6.4e-5, 1024).is_ok());
    }

    #[test]
    fn amax_is_finite_positive_and_monotonic_in_companion_mass() {
        let range = max_acceleration_from_orbit(1.0, 0.1, 1.4).unwrap();
        assert!(range.end.is_finite() && range.end > 0.0);
        assert_eq!(range.start, -range.end);

        let mut last = 0.0;
        for mc in [0.01, 0.1, 0.5, 1.0, 4.0, 10.0] {
            let r = max_acceleration_from_orbit(1.0, mc, 1.4).unwrap();
            assert!(r.end > last, "amax not increasing at mc={mc}");
            last = r.end;
        }
    }

    #[test]
    fn amax_rejects_degenerate_orbits() {
        assert!(max_acceleration_from_orbit(0.0, 0.1, 1.4).is_err());
        assert!(max_acceleration_from_orbit(1.0, 0.0, 1.4).is_err());
        assert!(max_acceleration_from_orbit(1.0, 0.1, 0.0).is_err());
    }

    #[test]
    fn fft_size_rounds_up_except_on_exact_powers() {
        assert_eq!(next_power_of_two_fft_size(1000).unwrap(), 1024);
        assert_eq!(next_power_of_two_fft_size(1025).unwrap(), 2048);
        // Exact power of two: used unchanged, not doubled.
        assert_eq!(next_power_of_two_fft_size(1024).unwrap(), 1024);
        assert_eq!(next_power_of_two_fft_size(1).unwrap(), 1);
        assert!(next_power_of_two_fft_size(0).is_err());
    }
}
