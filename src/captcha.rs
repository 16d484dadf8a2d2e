//! Human-verification gate. Challenges are small arithmetic questions held
//! in an in-memory store with a TTL; solving one yields a token whose
//! claims carry `human: true`. Image captchas stay an external concern.

use dashmap::DashMap;
use rand::distributions::Alphanumeric;
use rand::Rng;
use std::sync::Arc;
use std::time::{Duration, Instant};

const CHALLENGE_TTL: Duration = Duration::from_secs(300);

#[derive(Clone)]
pub struct CaptchaService {
    challenges: Arc<DashMap<String, (i64, Instant)>>,
}

pub struct Challenge {
    pub id: String,
    pub question: String,
}

impl CaptchaService {
    pub fn new() -> Self {
        Self { challenges: Arc::new(DashMap::new()) }
    }

    pub fn issue(&self) -> Challenge {
        let mut rng = rand::thread_rng();
        let a: i64 = rng.gen_range(1..10);
        let b: i64 = rng.gen_range(1..10);
        let id: String = (&mut rng)
            .sample_iter(&Alphanumeric)
            .take(16)
            .map(char::from)
            .collect();
        self.challenges.insert(id.clone(), (a + b, Instant::now()));
        Challenge { id, question: format!("{a} + {b}") }
    }

    /// One-shot check: the challenge is consumed whether or not the answer
    /// is right.
    pub fn verify(&self, id: &str, answer: i64) -> bool {
        match self.challenges.remove(id) {
            Some((_, (expected, issued))) => {
                issued.elapsed() < CHALLENGE_TTL && expected == answer
            }
            None => false,
        }
    }

    /// Test hook: register a challenge with a known answer.
    pub fn test_insert_challenge(&self, id: &str, answer: i64) {
        self.challenges.insert(id.to_string(), (answer, Instant::now()));
    }
}

impl Default for CaptchaService {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_consumes_challenge() {
        let svc = CaptchaService::new();
        svc.test_insert_challenge("c1", 7);
        assert!(svc.verify("c1", 7));
        assert!(!svc.verify("c1", 7));
    }

    #[test]
    fn wrong_answer_rejected() {
        let svc = CaptchaService::new();
        svc.test_insert_challenge("c2", 7);
        assert!(!svc.verify("c2", 8));
    }

    #[test]
    fn issued_question_is_solvable() {
        let svc = CaptchaService::new();
        let ch = svc.issue();
        let parts: Vec<i64> = ch.question.split(" + ").map(|p| p.parse().unwrap()).collect();
        assert!(svc.verify(&ch.id, parts[0] + parts[1]));
    }
}
