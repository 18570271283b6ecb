//! 发送限流模块 - 按来源 IP 的滑动窗口限流

use std::collections::{HashMap, VecDeque};
use std::net::IpAddr;
use std::time::{Duration, Instant};

/// 默认窗口
pub const SEND_WINDOW: Duration = Duration::from_secs(10);

/// 滑动窗口限流器
#[derive(Debug)]
pub struct SendThrottle {
    /// 窗口内允许的次数
    limit: usize,
    window: Duration,
    /// 每个来源最近的请求时间
    hits: HashMap<IpAddr, VecDeque<Instant>>,
}

impl SendThrottle {
    pub fn new(limit: usize) -> Self {
        Self::with_window(limit, SEND_WINDOW)
    }

    /// 自定义窗口（测试用）
    pub fn with_window(limit: usize, window: Duration) -> Self {
        Self {
            limit: limit.max(1),
            window,
            hits: HashMap::new(),
        }
    }

    /// 检查并记录一次请求
    pub fn check(&mut self, ip: IpAddr) -> bool {
        self.check_at(ip, Instant::now())
    }

    /// 检查并记录一次请求（带时间戳，用于测试）
    pub fn check_at(&mut self, ip: IpAddr, now: Instant) -> bool {
        let window = self.window;
        let queue = self.hits.entry(ip).or_default();
        while let Some(front) = queue.front() {
            if now.duration_since(*front) >= window {
                queue.pop_front();
            } else {
                break;
            }
        }

        if queue.len() >= self.limit {
            return false;
        }
        queue.push_back(now);
        true
    }

    /// 清理已过窗口的来源
    pub fn prune(&mut self, now: Instant) {
        let window = self.window;
        self.hits
            .retain(|_, q| q.back().map_or(false, |last| now.duration_since(*last) < window));
    }

    pub fn tracked_sources(&self) -> usize {
        self.hits.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ip(last: u8) -> IpAddr {
        IpAddr::from([192, 168, 1, last])
    }

    #[test]
    fn test_limit_within_window() {
        let mut throttle = SendThrottle::new(2);
        let start = Instant::now();

        assert!(throttle.check_at(ip(1), start));
        assert!(throttle.check_at(ip(1), start + Duration::from_secs(1)));
        assert!(!throttle.check_at(ip(1), start + Duration::from_secs(2)));
        // 其他来源不受影响
        assert!(throttle.check_at(ip(2), start + Duration::from_secs(2)));
    }

    #[test]
    fn test_window_slides() {
        let mut throttle = SendThrottle::new(1);
        let start = Instant::now();

        assert!(throttle.check_at(ip(1), start));
        assert!(!throttle.check_at(ip(1), start + Duration::from_secs(9)));
        assert!(throttle.check_at(ip(1), start + Duration::from_secs(10)));
    }

    #[test]
    fn test_rejected_requests_do_not_extend_window() {
        let mut throttle = SendThrottle::with_window(1, Duration::from_secs(5));
        let start = Instant::now();

        assert!(throttle.check_at(ip(1), start));
        assert!(!throttle.check_at(ip(1), start + Duration::from_secs(4)));
        assert!(throttle.check_at(ip(1), start + Duration::from_secs(5)));
    }

    #[test]
    fn test_prune() {
        let mut throttle = SendThrottle::new(3);
        let start = Instant::now();
        throttle.check_at(ip(1), start);
        throttle.check_at(ip(2), start + Duration::from_secs(8));

        throttle.prune(start + Duration::from_secs(12));
        assert_eq!(throttle.tracked_sources(), 1);
    }
}
