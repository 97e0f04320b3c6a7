// src/rtd.rs
//
// Platinum RTD resistance -> temperature (Callendar-Van Dusen, ITS-90).

/// ITS-90 coefficients.
const A: f64 = 3.9083e-3;
const B: f64 = -5.7750e-7;

/// Sub-zero corrections, highest power first.
const PT1000_CORRECTION: [f64; 6] = [
    1.51892983e-15,
    -2.85842067e-12,
    -5.34227299e-09,
    1.80282972e-05,
    -1.61875985e-02,
    4.84112370e+00,
];
const PT100_CORRECTION: [f64; 6] = [
    1.51892983e-10,
    -2.85842067e-08,
    -5.34227299e-06,
    1.80282972e-03,
    -1.61875985e-01,
    4.84112370e+00,
];

/// Resistance window in which a reading plausibly comes from a PT1000.
pub const PT1000_WINDOW: (f64, f64) = (500.0, 3000.0);

pub fn plausible_pt1000(ohms: f64) -> bool {
    ohms > PT1000_WINDOW.0 && ohms < PT1000_WINDOW.1
}

fn horner(coeffs: &[f64], x: f64) -> f64 {
    coeffs.iter().fold(0.0, |acc, c| acc * x + c)
}

/// Temperature in °C of an RTD with nominal resistance `r0` reading `r` ohms.
pub fn r_to_t(r: f64, r0: f64) -> f64 {
    let correction: &[f64] = if (r0 - 1000.0).abs() < 1e-3 {
        &PT1000_CORRECTION
    } else if (r0 - 100.0).abs() < 1e-3 {
        &PT100_CORRECTION
    } else {
        &[]
    };

    let mut t = (-r0 * A + (r0 * r0 * A * A - 4.0 * r0 * B * (r0 - r)).sqrt()) / (2.0 * r0 * B);
    if r < r0 {
        t += horner(correction, r);
    }
    t
}

/// PT1000 shorthand.
pub fn pt1000(r: f64) -> f64 {
    r_to_t(r, 1000.0)
}
