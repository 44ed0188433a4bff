use crate::adapter::{build_prompt_with_files, Adapter, ExecuteRequest};
use futures::future::join_all;
use futures::StreamExt;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;

/// Outcome of one shard's execution against its assigned service.
pub struct ShardResult {
    pub service_id: String,
    pub text: String,
    pub error: Option<String>,
    pub duration: Duration,
}

/// Aggregate outcome of a parallel split across services.
pub struct ParallelResult {
    pub aggregated_text: String,
    pub successful_count: usize,
    pub failed_count: usize,
    pub total_duration: Duration,
}

/// Splits `files` round-robin across `service_ids`, keeping shard byte
/// totals roughly balanced rather than strictly by count: files are
/// assigned one at a time in original order, always to whichever
/// shard currently holds the fewest cumulative bytes.
fn shard_files(files: &[String], service_count: usize) -> Vec<Vec<String>> {
    let mut shards: Vec<Vec<String>> = vec![Vec::new(); service_count];
    let mut shard_bytes = vec![0u64; service_count];

    for file in files {
        let size = std::fs::metadata(file).map(|m| m.len()).unwrap_or(0);
        let (idx, _) = shard_bytes
            .iter()
            .enumerate()
            .min_by_key(|(_, bytes)| **bytes)
            .unwrap();
        shards[idx].push(file.clone());
        shard_bytes[idx] += size;
    }

    shards
}

/// Runs one execution per shard concurrently, bounded by
/// `max_workers`, and aggregates the results in original service
/// order. A single shard failing does not fail the whole request —
/// its error is folded into the aggregate text and the failed count.
pub async fn execute_parallel(
    adapters: &[Arc<dyn Adapter>],
    prompt: &str,
    files: &[String],
    timeout_secs: u64,
    max_workers: usize,
) -> ParallelResult {
    let shards = shard_files(files, adapters.len());
    let semaphore = Arc::new(Semaphore::new(max_workers.max(1)));
    let started = Instant::now();

    let mut tasks = Vec::new();
    for (adapter, shard) in adapters.iter().zip(shards.into_iter()) {
        let adapter = Arc::clone(adapter);
        let semaphore = Arc::clone(&semaphore);
        let prompt = prompt.to_string();
        let service_id = adapter.id().to_string();

        tasks.push(tokio::spawn(async move {
            let _permit = semaphore.acquire_owned().await.expect("semaphore closed");
            let shard_start = Instant::now();
            let sub_prompt = build_prompt_with_files(&prompt, &shard);
            let req = ExecuteRequest {
                prompt: sub_prompt,
                model: None,
                timeout_secs,
            };

            let fut = async {
                let mut stream = adapter.execute(req);
                let mut text = String::new();
                while let Some(chunk) = stream.next().await {
                    match chunk {
                        Ok(c) => text.push_str(&c.text),
                        Err(e) => return Err(e.to_string()),
                    }
                }
                Ok(text)
            };

            let outcome = tokio::time::timeout(Duration::from_secs(timeout_secs), fut).await;
            let (text, error) = match outcome {
                Ok(Ok(text)) => (text, None),
                Ok(Err(e)) => (String::new(), Some(e)),
                Err(_) => (String::new(), Some(format!("timed out after {}s", timeout_secs))),
            };

            ShardResult {
                service_id,
                text,
                error,
                duration: shard_start.elapsed(),
            }
        }));
    }

    let results = join_all(tasks).await;
    let mut successful_count = 0;
    let mut failed_count = 0;
    let mut sections = Vec::new();

    for result in results {
        match result {
            Ok(shard) => {
                if let Some(err) = &shard.error {
                    failed_count += 1;
                    sections.push(format!(
                        "## Results from {}\n(failed: {})",
                        shard.service_id, err
                    ));
                } else {
                    successful_count += 1;
                    sections.push(format!("## Results from {}\n{}", shard.service_id, shard.text));
                }
            }
            Err(join_err) => {
                failed_count += 1;
                sections.push(format!("## Results from <unknown>\n(task panicked: {})", join_err));
            }
        }
    }

    ParallelResult {
        aggregated_text: sections.join("\n\n"),
        successful_count,
        failed_count,
        total_duration: started.elapsed(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shard_files_balances_empty_metadata_evenly() {
        let files = vec!["a".to_string(), "b".to_string(), "c".to_string()];
        let shards = shard_files(&files, 3);
        assert_eq!(shards.iter().map(|s| s.len()).sum::<usize>(), 3);
        assert!(shards.iter().all(|s| s.len() <= 1));
    }

    #[test]
    fn shard_files_handles_more_files_than_services() {
        let files: Vec<String> = (0..6).map(|i| format!("f{}", i)).collect();
        let shards = shard_files(&files, 2);
        assert_eq!(shards.len(), 2);
        assert_eq!(shards.iter().map(|s| s.len()).sum::<usize>(), 6);
    }
}
