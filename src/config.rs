/// Core knobs consumed by the handlers, derived from the environment.
#[derive(Clone, Debug)]
pub struct BoardConfig {
    /// Posts shown per thread on the board page.
    pub posts_previewed: usize,
    /// Whether posting requires passing the human-verification gate first.
    pub require_captcha: bool,
}

impl BoardConfig {
    pub fn from_env() -> Self {
        fn usize_env(name: &str, default: usize) -> usize {
            std::env::var(name).ok().and_then(|v| v.parse().ok()).unwrap_or(default)
        }
        fn bool_env(name: &str, default: bool) -> bool {
            std::env::var(name)
                .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
                .unwrap_or(default)
        }
        Self {
            posts_previewed: usize_env("TABULA_POSTS_PREVIEWED", 5),
            require_captcha: bool_env("TABULA_REQUIRE_CAPTCHA", true),
        }
    }
}
