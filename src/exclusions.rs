//! Exclusion rules keyed by occasion and weather.
//!
//! Two static tables — one over the (formality, time, location, activity)
//! tuple, one over the climate label — map context to per-attribute forbidden
//! value names. The engine unions both per attribute. An unmatched tuple or
//! climate simply contributes no exclusions; there is no default rule.

use std::collections::{HashMap, HashSet};

use crate::models::{Occasion, Weather};

type RuleSet = &'static [(&'static str, &'static [&'static str])];

fn occasion_rules(formality: &str, time: &str, location: &str, activity: &str) -> RuleSet {
    match (formality, time, location, activity) {
        ("FORMAL", "DIA", "CAMPO", "FESTA") => &[
            ("Material", &["Couro", "Jeans", "Malha | Retilínea"]),
            ("Superfície", &["Brilhante"]),
        ],
        ("FORMAL", "NOITE", "CAMPO", "FESTA") => {
            &[("Material", &["Couro", "Jeans", "Malha | Retilínea"])]
        }
        ("INFORMAL", "DIA", "CIDADE", "ESPORTE") => &[(
            "Material",
            &["Couro", "Jeans", "Tecido festivo", "Tecido plano"],
        )],
        ("INFORMAL", "DIA", "CIDADE", "LAZER") => {
            &[("Material", &["Couro", "Jeans", "Tecido festivo"])]
        }
        ("INFORMAL", "DIA", "CIDADE", "ATIVIDADES DIA A DIA") => {
            &[("Material", &["Tecido festivo", "Tecido plano"])]
        }
        ("INFORMAL", "NOITE", "CIDADE", "ESPORTE") => &[
            (
                "Material",
                &["Couro", "Jeans", "Tecido festivo", "Tecido plano"],
            ),
            ("Estrutura", &["Pesado | Estruturado"]),
        ],
        ("INFORMAL", "DIA", "PRAIA", "ESPORTE") => &[
            ("Material", &["Couro", "Tecido festivo", "Tecido plano"]),
            ("Estrutura", &["Pesado | Estruturado"]),
        ],
        ("INFORMAL", "DIA", "PRAIA", "LAZER") => {
            &[("Material", &["Couro", "Tecido festivo", "Tecido plano"])]
        }
        ("INFORMAL", "DIA", "PRAIA", "FESTA") => {
            &[("Material", &["Couro", "Tecido festivo", "Tecido plano"])]
        }
        ("INFORMAL", "DIA", "PRAIA", "ATIVIDADES DIA A DIA") => {
            &[("Material", &["Couro", "Jeans", "Tecido festivo"])]
        }
        ("INFORMAL", "NOITE", "PRAIA", "LAZER") => &[
            ("Material", &["Couro", "Tecido festivo"]),
            ("Estrutura", &["Pesado | Estruturado"]),
        ],
        ("INFORMAL", "NOITE", "PRAIA", "FESTA") => &[("Material", &["Couro", "Tecido festivo"])],
        ("INFORMAL", "DIA", "CAMPO", "ESPORTE") => &[("Material", &["Tecido festivo"])],
        ("INFORMAL", "DIA", "CAMPO", "LAZER") => &[("Material", &["Tecido festivo"])],
        ("INFORMAL", "DIA", "CAMPO", "FESTA") => &[("Material", &["Tecido festivo"])],
        ("INFORMAL", "DIA", "CAMPO", "ATIVIDADES DIA A DIA") => {
            &[("Material", &["Tecido festivo", "Tecido plano"])]
        }
        ("INFORMAL", "NOITE", "CAMPO", "LAZER") => &[
            ("Material", &["Tecido festivo"]),
            ("Estrutura", &["Pesado | Estruturado"]),
        ],
        _ => &[],
    }
}

fn weather_rules(climate: &str) -> RuleSet {
    match climate {
        "Hot" => &[("Estrutura", &["Pesado | Estruturado"])],
        "Cold" => &[("Estrutura", &["Leve | Fluido"])],
        _ => &[],
    }
}

/// Union of occasion and weather exclusions, keyed by plain attribute name.
/// A partially-filled occasion (any missing field) matches nothing.
pub fn exclusions_for(occasion: &Occasion, weather: &Weather) -> HashMap<String, HashSet<String>> {
    let mut merged: HashMap<String, HashSet<String>> = HashMap::new();

    let occasion_set = match (
        occasion.formality.as_deref(),
        occasion.time.as_deref(),
        occasion.location.as_deref(),
        occasion.activity.as_deref(),
    ) {
        (Some(f), Some(t), Some(l), Some(a)) => occasion_rules(f, t, l, a),
        _ => &[],
    };
    let weather_set = weather
        .climate
        .as_deref()
        .map(weather_rules)
        .unwrap_or(&[]);

    for (attribute, values) in occasion_set.iter().chain(weather_set.iter()) {
        let entry = merged.entry(attribute.to_string()).or_default();
        entry.extend(values.iter().map(|v| v.to_string()));
    }

    merged
}
