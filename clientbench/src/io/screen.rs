//! UI synchronization through image matching on screen.
//!
//! The matcher itself is an external collaborator. [`CommandScreenMatcher`]
//! talks to a helper program over a tiny argv/stdout protocol:
//!
//! - `<helper...> locate <image>`: exit 0 and print `x y` when found, exit 1 when not.
//! - `<helper...> click <x> <y>`: exit 0 on success.

use std::path::{Path, PathBuf};
use std::process::Command;
use std::thread;
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, info, instrument};

use crate::error::BenchError;
use crate::io::process::run_command_with_timeout;

pub const DEFAULT_HELPER_TIMEOUT: Duration = Duration::from_secs(30);
const HELPER_OUTPUT_LIMIT_BYTES: usize = 4096;

/// Screen coordinates of a match.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ScreenPoint {
    pub x: i32,
    pub y: i32,
}

/// Image-recognition and click capability.
pub trait ScreenMatcher {
    /// Where `image` currently appears on screen, if anywhere.
    fn locate(&self, image: &Path) -> Result<Option<ScreenPoint>>;

    fn click(&self, at: ScreenPoint) -> Result<()>;
}

/// Poll the screen until one of `candidates` appears, then click it.
///
/// Candidates are checked in order on every poll; the first hit wins. Returns
/// the matched image.
#[instrument(skip_all, fields(label = %label, candidates = candidates.len(), timeout_secs = find_timeout.as_secs()))]
pub fn click_first_match<M: ScreenMatcher + ?Sized>(
    matcher: &M,
    label: &str,
    candidates: &[PathBuf],
    find_timeout: Duration,
    poll_interval: Duration,
) -> Result<PathBuf> {
    let deadline = Instant::now() + find_timeout;
    loop {
        debug!(label, "looking for button");
        for image in candidates {
            if let Some(point) = matcher
                .locate(image)
                .with_context(|| format!("locate {}", image.display()))?
            {
                info!(label, image = %image.display(), x = point.x, y = point.y, "clicking button");
                matcher
                    .click(point)
                    .with_context(|| format!("click {label} at ({}, {})", point.x, point.y))?;
                return Ok(image.clone());
            }
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(BenchError::ElementNotFound {
                label: label.to_string(),
                candidates: candidates.to_vec(),
                timeout: find_timeout,
            }
            .into());
        }
        thread::sleep(poll_interval.min(deadline - now));
    }
}

/// [`ScreenMatcher`] that shells out to a helper program.
#[derive(Debug, Clone)]
pub struct CommandScreenMatcher {
    command: Vec<String>,
    timeout: Duration,
}

impl CommandScreenMatcher {
    pub fn new(command: Vec<String>, timeout: Duration) -> Result<Self> {
        if command.first().is_none_or(|program| program.trim().is_empty()) {
            bail!("screen helper command must be a non-empty array");
        }
        Ok(Self { command, timeout })
    }

    fn helper(&self) -> Command {
        let mut cmd = Command::new(&self.command[0]);
        cmd.args(&self.command[1..]);
        cmd
    }
}

impl ScreenMatcher for CommandScreenMatcher {
    fn locate(&self, image: &Path) -> Result<Option<ScreenPoint>> {
        let mut cmd = self.helper();
        cmd.arg("locate").arg(image);
        let output = run_command_with_timeout(cmd, self.timeout, HELPER_OUTPUT_LIMIT_BYTES)
            .context("run screen helper")?;
        if output.timed_out {
            bail!("screen helper timed out after {:?}", self.timeout);
        }
        match output.status.code() {
            Some(0) => parse_point(&String::from_utf8_lossy(&output.stdout)).map(Some),
            Some(1) => Ok(None),
            code => Err(anyhow!(
                "screen helper failed with status {code:?}: {}",
                String::from_utf8_lossy(&output.stderr).trim()
            )),
        }
    }

    fn click(&self, at: ScreenPoint) -> Result<()> {
        let mut cmd = self.helper();
        cmd.arg("click").arg(at.x.to_string()).arg(at.y.to_string());
        let output = run_command_with_timeout(cmd, self.timeout, HELPER_OUTPUT_LIMIT_BYTES)
            .context("run screen helper")?;
        if output.timed_out || !output.status.success() {
            bail!(
                "screen helper click failed with status {:?}",
                output.status.code()
            );
        }
        Ok(())
    }
}

fn parse_point(stdout: &str) -> Result<ScreenPoint> {
    let mut parts = stdout.split_whitespace().map(str::parse::<i32>);
    match (parts.next(), parts.next()) {
        (Some(Ok(x)), Some(Ok(y))) => Ok(ScreenPoint { x, y }),
        _ => Err(anyhow!("screen helper printed {:?}, expected `x y`", stdout.trim())),
    }
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::HashMap;

    use super::*;

    /// Images become visible after a number of `locate` calls for that image.
    struct DelayedScreen {
        visible_after: HashMap<PathBuf, (usize, ScreenPoint)>,
        locates: RefCell<Vec<PathBuf>>,
        clicks: RefCell<Vec<ScreenPoint>>,
    }

    impl DelayedScreen {
        fn new(visible: &[(&str, usize, ScreenPoint)]) -> Self {
            Self {
                visible_after: visible
                    .iter()
                    .map(|(name, after, point)| (PathBuf::from(name), (*after, *point)))
                    .collect(),
                locates: RefCell::new(Vec::new()),
                clicks: RefCell::new(Vec::new()),
            }
        }
    }

    impl ScreenMatcher for DelayedScreen {
        fn locate(&self, image: &Path) -> Result<Option<ScreenPoint>> {
            let mut locates = self.locates.borrow_mut();
            locates.push(image.to_path_buf());
            let seen = locates.iter().filter(|p| p.as_path() == image).count();
            Ok(self
                .visible_after
                .get(image)
                .and_then(|(after, point)| (seen > *after).then_some(*point)))
        }

        fn click(&self, at: ScreenPoint) -> Result<()> {
            self.clicks.borrow_mut().push(at);
            Ok(())
        }
    }

    fn images(names: &[&str]) -> Vec<PathBuf> {
        names.iter().map(PathBuf::from).collect()
    }

    #[test]
    fn first_candidate_in_order_wins() {
        let screen = DelayedScreen::new(&[
            ("b.png", 0, ScreenPoint { x: 2, y: 2 }),
            ("c.png", 0, ScreenPoint { x: 3, y: 3 }),
        ]);

        let matched = click_first_match(
            &screen,
            "singleplayer",
            &images(&["a.png", "b.png", "c.png"]),
            Duration::from_secs(1),
            Duration::from_millis(10),
        )
        .expect("match");

        assert_eq!(matched, PathBuf::from("b.png"));
        assert_eq!(*screen.locates.borrow(), images(&["a.png", "b.png"]));
        assert_eq!(*screen.clicks.borrow(), vec![ScreenPoint { x: 2, y: 2 }]);
    }

    #[test]
    fn keeps_polling_until_a_candidate_appears() {
        let screen = DelayedScreen::new(&[("world.png", 2, ScreenPoint { x: 5, y: 6 })]);

        let matched = click_first_match(
            &screen,
            "world",
            &images(&["world.png"]),
            Duration::from_secs(5),
            Duration::from_millis(10),
        )
        .expect("match");

        assert_eq!(matched, PathBuf::from("world.png"));
        assert_eq!(screen.locates.borrow().len(), 3);
        assert_eq!(screen.clicks.borrow().len(), 1);
    }

    #[test]
    fn element_not_found_after_timeout() {
        let screen = DelayedScreen::new(&[]);
        let candidates = images(&["a.png", "b.png", "c.png"]);
        let timeout = Duration::from_millis(100);

        let start = Instant::now();
        let err = click_first_match(
            &screen,
            "singleplayer",
            &candidates,
            timeout,
            Duration::from_millis(20),
        )
        .unwrap_err();

        assert!(start.elapsed() >= timeout);
        assert!(screen.clicks.borrow().is_empty());
        match err.downcast_ref::<BenchError>() {
            Some(BenchError::ElementNotFound {
                label,
                candidates: tried,
                ..
            }) => {
                assert_eq!(label, "singleplayer");
                assert_eq!(tried, &candidates);
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn parses_helper_point() {
        assert_eq!(
            parse_point("640 360\n").expect("point"),
            ScreenPoint { x: 640, y: 360 }
        );
        assert!(parse_point("found").is_err());
    }

    #[test]
    fn rejects_empty_helper_command() {
        assert!(CommandScreenMatcher::new(Vec::new(), DEFAULT_HELPER_TIMEOUT).is_err());
    }

    #[cfg(unix)]
    #[test]
    fn command_matcher_maps_exit_codes() {
        let found = CommandScreenMatcher::new(
            vec!["sh".into(), "-c".into(), "echo 10 20".into(), "helper".into()],
            DEFAULT_HELPER_TIMEOUT,
        )
        .expect("matcher");
        assert_eq!(
            found.locate(Path::new("a.png")).expect("locate"),
            Some(ScreenPoint { x: 10, y: 20 })
        );

        let missing = CommandScreenMatcher::new(
            vec!["sh".into(), "-c".into(), "exit 1".into(), "helper".into()],
            DEFAULT_HELPER_TIMEOUT,
        )
        .expect("matcher");
        assert_eq!(missing.locate(Path::new("a.png")).expect("locate"), None);
    }
}
