use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::{Duration, Instant};

use once_cell::sync::Lazy;
use parking_lot::Mutex;
use teloxide::prelude::*;
use tracing::{info, warn};

use crate::config::CONFIG;
use crate::utils::telegram::reply_text;

static RATE_LIMITS: Lazy<Mutex<HashMap<i64, Instant>>> = Lazy::new(|| Mutex::new(HashMap::new()));
static WHITELIST_CACHE: Lazy<Mutex<Option<Vec<String>>>> = Lazy::new(|| Mutex::new(None));
static WHITELIST_LOADED: AtomicBool = AtomicBool::new(false);

fn check_rate_limit(
    limits: &mut HashMap<i64, Instant>,
    user_id: i64,
    now: Instant,
    window: Duration,
) -> bool {
    if let Some(last) = limits.get(&user_id) {
        if now.duration_since(*last) < window {
            return true;
        }
    }

    limits.insert(user_id, now);
    false
}

pub fn is_rate_limited(user_id: i64) -> bool {
    check_rate_limit(
        &mut RATE_LIMITS.lock(),
        user_id,
        Instant::now(),
        Duration::from_secs(CONFIG.rate_limit_seconds),
    )
}

fn parse_whitelist(content: &str) -> Vec<String> {
    content
        .lines()
        .map(|line| line.trim())
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .map(|line| line.to_string())
        .collect()
}

pub fn load_whitelist() {
    if WHITELIST_LOADED.swap(true, Ordering::SeqCst) {
        return;
    }

    let path = &CONFIG.whitelist_file_path;
    let mut cache = WHITELIST_CACHE.lock();

    match std::fs::read_to_string(path) {
        Ok(content) => {
            let ids = parse_whitelist(&content);
            info!("Loaded whitelist file {} ({} entries)", path, ids.len());
            *cache = Some(ids);
        }
        Err(err) => {
            warn!("Whitelist file {} not found or failed to read: {}", path, err);
            *cache = None;
        }
    }
}

fn is_whitelisted(id: i64) -> bool {
    if !WHITELIST_LOADED.load(Ordering::SeqCst) {
        load_whitelist();
    }
    let cache = WHITELIST_CACHE.lock();
    match &*cache {
        None => true,
        Some(list) => list.contains(&id.to_string()),
    }
}

pub fn is_access_allowed(user_id: i64, chat_id: i64) -> bool {
    is_whitelisted(user_id) || is_whitelisted(chat_id)
}

pub async fn check_access_control(bot: &Bot, message: &Message) -> bool {
    let user_id = message
        .from
        .as_ref()
        .and_then(|user| i64::try_from(user.id.0).ok())
        .unwrap_or_default();
    let chat_id = message.chat.id.0;

    if !is_access_allowed(user_id, chat_id) {
        let _ = reply_text(
            bot,
            message.chat.id,
            message.id,
            "You are not authorized to use the drawing service. Please contact the administrator.",
        )
        .await;
        return false;
    }

    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_request_inside_window_is_limited() {
        let mut limits = HashMap::new();
        let start = Instant::now();
        let window = Duration::from_secs(30);

        assert!(!check_rate_limit(&mut limits, 7, start, window));
        assert!(check_rate_limit(
            &mut limits,
            7,
            start + Duration::from_secs(5),
            window
        ));
        assert!(!check_rate_limit(&mut limits, 8, start, window));
        assert!(!check_rate_limit(
            &mut limits,
            7,
            start + Duration::from_secs(31),
            window
        ));
    }

    #[test]
    fn whitelist_skips_comments_and_blank_lines() {
        let ids = parse_whitelist("# admins\n12345\n\n  -100200300  \n#67890\n");
        assert_eq!(ids, vec!["12345".to_string(), "-100200300".to_string()]);
    }
}
