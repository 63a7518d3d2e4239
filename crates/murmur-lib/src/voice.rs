//! Mapping requested voice parameters onto an engine's voice list.

use std::cmp::Ordering;

use tracing::debug;

use murmur_core::types::{VoiceDescriptor, VoiceParams, VoiceType};

/// Voices at or below this age count as children.
const CHILD_MAX_AGE: u8 = 15;

/// Compare `candidate` against the current `best`. `Greater` means the
/// candidate fits the request better, `Equal` means equally well.
fn compare(best: &VoiceDescriptor, candidate: &VoiceDescriptor, language: &str, voice_type: VoiceType) -> Ordering {
    let mut score = 0i32;

    if best.language == language {
        score -= 1;
    }
    if candidate.language == language {
        score += 1;
    }

    if best.gender != candidate.gender {
        let wanted = Some(voice_type.gender());
        if best.gender == wanted {
            score -= 1;
        }
        if candidate.gender == wanted {
            score += 1;
        }
    }

    let is_child = |age: Option<u8>| age.is_some_and(|a| a > 0 && a <= CHILD_MAX_AGE);
    if voice_type.is_child() {
        if is_child(best.age) {
            score -= 1;
        }
        if is_child(candidate.age) {
            score += 1;
        }
    } else if let (Some(best_age), Some(candidate_age)) = (best.age, candidate.age) {
        // Mostly adult voices are expected, so ages only count when both are known.
        if best_age > CHILD_MAX_AGE {
            score -= 1;
        }
        if candidate_age > CHILD_MAX_AGE {
            score += 1;
        }
    }

    score.cmp(&0)
}

/// Pick the voice index best matching `params`.
///
/// An exact synthesis voice name wins. Otherwise voices are ranked by
/// language, gender, then age, and `male2`/`female2` (`male3`/`female3`) take
/// the second (third) equally good voice. Returns `current` unchanged when
/// there are no voices.
pub fn select_voice(voices: &[VoiceDescriptor], params: &VoiceParams, current: usize) -> usize {
    if let Some(name) = &params.synthesis_voice {
        if let Some(i) = voices.iter().position(|v| &v.name == name) {
            return i;
        }
        debug!("no voice named {name}, matching by language and type");
    }

    let Some(first) = voices.first() else {
        return current;
    };

    let offset = params.voice_type.rank();
    let mut best = 0;
    let mut best_voice = first;
    let mut nth_match = 1;

    for (i, voice) in voices.iter().enumerate().skip(1) {
        match compare(best_voice, voice, &params.language, params.voice_type) {
            Ordering::Less => {}
            ord => {
                if ord == Ordering::Greater {
                    nth_match = 0;
                }
                if nth_match <= offset {
                    best = i;
                    best_voice = voice;
                }
                nth_match += 1;
            }
        }
    }

    debug!("selected voice {} for {}", voices[best].name, params.language);
    best
}

#[cfg(test)]
mod tests {
    use super::*;
    use murmur_core::types::Gender;

    fn voice(name: &str, language: &str, gender: Gender, age: Option<u8>) -> VoiceDescriptor {
        VoiceDescriptor {
            name: name.into(),
            language: language.into(),
            variant: None,
            gender: Some(gender),
            age,
        }
    }

    fn params(language: &str, voice_type: VoiceType) -> VoiceParams {
        VoiceParams {
            language: language.into(),
            voice_type,
            ..Default::default()
        }
    }

    fn catalog() -> Vec<VoiceDescriptor> {
        vec![
            voice("fr_m", "fr", Gender::Male, None),
            voice("en_m1", "en", Gender::Male, Some(40)),
            voice("en_f1", "en", Gender::Female, Some(30)),
            voice("en_f2", "en", Gender::Female, Some(35)),
            voice("en_child", "en", Gender::Female, Some(10)),
            voice("en_m2", "en", Gender::Male, Some(50)),
        ]
    }

    #[test]
    fn language_and_gender_win() {
        let voices = catalog();
        assert_eq!(select_voice(&voices, &params("en", VoiceType::Male1), 0), 1);
        assert_eq!(select_voice(&voices, &params("en", VoiceType::Female1), 0), 2);
        assert_eq!(select_voice(&voices, &params("fr", VoiceType::Male1), 3), 0);
    }

    #[test]
    fn numbered_types_take_later_matches() {
        let voices = catalog();
        assert_eq!(select_voice(&voices, &params("en", VoiceType::Female2), 0), 3);
        assert_eq!(select_voice(&voices, &params("en", VoiceType::Male2), 0), 5);
    }

    #[test]
    fn child_types_prefer_young_voices() {
        let voices = catalog();
        assert_eq!(select_voice(&voices, &params("en", VoiceType::ChildFemale), 0), 4);
    }

    #[test]
    fn exact_name_wins() {
        let voices = catalog();
        let p = VoiceParams {
            synthesis_voice: Some("en_f2".into()),
            ..params("fr", VoiceType::Male1)
        };
        assert_eq!(select_voice(&voices, &p, 0), 3);
    }

    #[test]
    fn unknown_name_falls_back_to_matching() {
        let voices = catalog();
        let p = VoiceParams {
            synthesis_voice: Some("nope".into()),
            ..params("en", VoiceType::Female1)
        };
        assert_eq!(select_voice(&voices, &p, 0), 2);
    }

    #[test]
    fn empty_list_keeps_current() {
        assert_eq!(select_voice(&[], &params("en", VoiceType::Male1), 7), 7);
    }
}
