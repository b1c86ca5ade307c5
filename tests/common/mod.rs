#![allow(dead_code)]

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

/// Writes the beta, packed omega and covparms files of one parameter group.
/// Omega is diagonal with `variance` on the diagonal.
pub fn write_parameter_group(
    dir: &Path,
    prefix: &str,
    group: u32,
    beta: &[f64],
    variance: f64,
    covparms: &[(&str, f64)],
) {
    let mut text = String::from("value\n");
    for b in beta {
        writeln!(text, "{b}").unwrap();
    }
    fs::write(dir.join(format!("{prefix}_beta_{group}.csv")), text).unwrap();

    let mut text = String::from("value\n");
    for i in 0..beta.len() {
        for j in 0..=i {
            writeln!(text, "{}", if i == j { variance } else { 0.0 }).unwrap();
        }
    }
    fs::write(dir.join(format!("{prefix}_omega_{group}.csv")), text).unwrap();

    let mut text = String::from("parameter,value\n");
    for (name, value) in covparms {
        writeln!(text, "{name},{value}").unwrap();
    }
    fs::write(dir.join(format!("{prefix}_covparms_{group}.csv")), text).unwrap();
}

pub const MORTALITY_BETA: [f64; 12] = [-3.0, 0.2, -0.1, 0.3, -0.5, 0.02, 0.03, 0.01, 0.8, 0.4, 0.5, 1.0];

pub const PLOT_HEADER: &str = "plot_id,latitude_deg,longitude_deg,elevation_m,basal_area_m2_ha,number_of_stems_ha,growth_step_length_yr,date_yr,harvested";
