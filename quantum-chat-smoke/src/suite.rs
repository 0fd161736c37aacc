use log::{error, info};
use quantum_chat_proto::msg::ChatContent;
use time::{OffsetDateTime, UtcOffset, macros::format_description};

use crate::check::{CheckError, Target, expect_ack};

const GREEN: &str = "\x1b[32m";
const RED: &str = "\x1b[31m";
const YELLOW: &str = "\x1b[33m";
const BLUE: &str = "\x1b[34m";
const RESET: &str = "\x1b[0m";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SmokeTest {
    Connection,
    ChatMessage,
}

impl SmokeTest {
    const ALL: [SmokeTest; 2] = [SmokeTest::Connection, SmokeTest::ChatMessage];

    fn name(self) -> &'static str {
        match self {
            SmokeTest::Connection => "Connection Test",
            SmokeTest::ChatMessage => "Chat Message Test",
        }
    }

    async fn run(self, target: &Target) -> Result<(), CheckError> {
        match self {
            SmokeTest::Connection => {
                let content = ChatContent {
                    text: "Connection test".into(),
                    timestamp: None,
                };
                let response = target.exchange(content).await?;
                expect_ack(&response, false)?;
            }
            SmokeTest::ChatMessage => {
                let content = ChatContent {
                    text: "Hello from test suite!".into(),
                    timestamp: Some(OffsetDateTime::now_utc().unix_timestamp()),
                };
                let response = target.exchange(content).await?;
                expect_ack(&response, true)?;
            }
        }
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct Summary {
    results: Vec<(&'static str, bool)>,
}

impl Summary {
    pub fn passed(&self) -> usize {
        self.results.iter().filter(|(_, ok)| *ok).count()
    }

    pub fn total(&self) -> usize {
        self.results.len()
    }

    pub fn all_passed(&self) -> bool {
        self.passed() == self.total()
    }

    pub fn failed(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.results
            .iter()
            .filter(|(_, ok)| !*ok)
            .map(|(name, _)| *name)
    }

    fn print(&self) {
        println!("\n{YELLOW}Test Summary:{RESET}");
        println!("Passed: {GREEN}{}/{}{RESET}", self.passed(), self.total());
        if self.all_passed() {
            println!("{GREEN}All tests passed!{RESET}");
        } else {
            println!("{RED}Some tests failed.{RESET}");
            println!("Failed tests:");
            for name in self.failed() {
                println!("{RED}- {name}{RESET}");
            }
        }
    }
}

/// Runs every smoke test in order, each on its own connection.
///
/// A failing test is recorded and never stops the run.
pub async fn run(target: &Target) -> anyhow::Result<Summary> {
    let started = OffsetDateTime::now_utc()
        .to_offset(UtcOffset::current_local_offset().unwrap_or(UtcOffset::UTC))
        .format(format_description!(
            "[year]-[month]-[day] [hour]:[minute]:[second]"
        ))?;
    println!("{YELLOW}Starting WebSocket test suite at {started}{RESET}");

    let mut summary = Summary::default();
    for test in SmokeTest::ALL {
        let name = test.name();
        println!("\n{BLUE}Running test: {name}{RESET}");

        match test.run(target).await {
            Ok(()) => {
                info!("{name} succeeded");
                println!("{GREEN}✓ Test passed: {name}{RESET}");
                summary.results.push((name, true));
            }
            Err(e) => {
                error!("{name} failed: {e}");
                println!("{RED}✗ Test failed: {name}{RESET}");
                summary.results.push((name, false));
            }
        }
    }

    summary.print();
    Ok(summary)
}
