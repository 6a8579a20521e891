//! Integration Test Harness
//!
//! Runs every integration test category and prints a summary.
//!
//! # Usage
//!
//! Run all tests:
//! ```
//! cargo run -p integration-tests
//! ```
//!
//! Run specific test categories:
//! ```
//! cargo test -p integration-tests --test lease_tests
//! cargo test -p integration-tests --test failure_tests
//! cargo test -p integration-tests --test concurrency_tests
//! ```
//!
//! Run with increased logging:
//! ```
//! RUST_LOG=dgc=debug cargo run -p integration-tests
//! ```

mod common;

use std::process::Command;
use std::time::{Duration, Instant};

use common::TestSuiteResults;

/// Test category
#[derive(Debug, Clone)]
struct TestCategory {
    name: &'static str,
    description: &'static str,
    test_name: &'static str,
}

const TEST_CATEGORIES: &[TestCategory] = &[
    TestCategory {
        name: "Lease Tests",
        description: "dirty/clean over TCP, renewal and expiry",
        test_name: "lease_tests",
    },
    TestCategory {
        name: "Failure Tests",
        description: "Injected call failures, stale retries, malformed requests",
        test_name: "failure_tests",
    },
    TestCategory {
        name: "Concurrency Tests",
        description: "Racing registrations and drops, many clients",
        test_name: "concurrency_tests",
    },
];

fn run_test_category(category: &TestCategory) -> (bool, Duration) {
    println!("\n{}", "=".repeat(80));
    println!("Running: {} - {}", category.name, category.description);
    println!("{}", "=".repeat(80));

    let start = Instant::now();
    let status = Command::new("cargo")
        .args(["test", "-p", "integration-tests", "--test", category.test_name])
        .status();
    let duration = start.elapsed();

    match status {
        Ok(status) => (status.success(), duration),
        Err(e) => {
            eprintln!("failed to run {}: {}", category.test_name, e);
            (false, duration)
        }
    }
}

fn main() {
    let total_start = Instant::now();
    let mut results = TestSuiteResults::default();
    let mut rows = Vec::new();

    for category in TEST_CATEGORIES {
        let (success, duration) = run_test_category(category);
        results.record(success);
        rows.push((category.name, success, duration));
    }

    println!("\n{}", "=".repeat(80));
    println!("FINAL SUMMARY");
    println!("{}", "=".repeat(80));
    println!(
        "Categories: {} | Passed: {} | Failed: {}",
        rows.len(),
        results.passed,
        results.failed
    );
    println!("Total Duration: {:?}\n", total_start.elapsed());

    for (name, success, duration) in &rows {
        let status = if *success { "PASS" } else { "FAIL" };
        println!("{:<30} {:<10} {:?}", name, status, duration);
    }

    if !results.all_passed() {
        std::process::exit(1);
    }
}
