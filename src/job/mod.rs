//
// Copyright (c) 2020-2021 science+computing ag and other contributors
//
// This program and the accompanying materials are made
// available under the terms of the Eclipse Public License 2.0
// which is available at https://www.eclipse.org/legal/epl-2.0/
//
// SPDX-License-Identifier: EPL-2.0
//

use std::collections::BTreeSet;
use std::collections::VecDeque;

use indexmap::IndexMap;

mod artifact;
mod status;

pub use artifact::ArchSpec;
pub use artifact::Artifact;
pub use artifact::ArtifactId;
pub use artifact::ArtifactKind;
pub use status::JobStatus;

/// A node in the build graph.
#[derive(Clone, Debug)]
pub struct Job {
    /// Failures of unstable jobs are reported as ignored and do not fail
    /// the build on their own (their products still cascade).
    pub unstable: bool,
    pub deps: Vec<ArtifactId>,
    pub products: Vec<ArtifactId>,
    pub capabilities: BTreeSet<String>,
    pub status: JobStatus,
    pub exit_code: Option<i64>,
    pub run_time: Option<f64>,
}

impl Job {
    pub fn new(unstable: bool, capabilities: BTreeSet<String>) -> Self {
        Job {
            unstable,
            deps: Vec::new(),
            products: Vec::new(),
            capabilities,
            status: JobStatus::Waiting,
            exit_code: None,
            run_time: None,
        }
    }
}

/// Fail a job and cascade through everything that consumes its products.
///
/// A RUNNING job moves to WAITING_FOR_DONE (its completion message is still
/// owed); anything else becomes FAILED, or IGNORED_FAILURE if unstable.
/// Every product is marked received-and-failed, and every job depending on
/// such a product is failed in turn. Artifacts that already failed stop the
/// walk, which makes the whole operation idempotent.
pub fn fail_job(jobs: &mut IndexMap<String, Job>, artifacts: &mut [Artifact], name: &str) {
    let mut worklist: VecDeque<String> = VecDeque::new();
    worklist.push_back(name.to_string());

    while let Some(current) = worklist.pop_front() {
        let products = {
            let job = match jobs.get_mut(&current) {
                Some(job) => job,
                None => continue,
            };
            job.status = if job.status == JobStatus::Running {
                JobStatus::WaitingForDone
            } else if job.unstable {
                JobStatus::IgnoredFailure
            } else {
                JobStatus::Failed
            };
            job.products.clone()
        };

        for product in products {
            let artifact = &mut artifacts[product.0];
            if artifact.failed {
                continue;
            }
            artifact.failed = true;
            artifact.received = true;

            worklist.extend(
                jobs.iter()
                    .filter(|(_, job)| job.deps.contains(&product))
                    .map(|(consumer, _)| consumer.clone()),
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn artifact(name: &str) -> Artifact {
        Artifact::new(
            ArtifactKind::Package,
            name.into(),
            Some("1.0".into()),
            Some(ArchSpec::One("x86_64".into())),
        )
    }

    /// a -> p -> b -> q -> c, plus d consuming p as well
    fn chain() -> (IndexMap<String, Job>, Vec<Artifact>) {
        let artifacts = vec![artifact("p"), artifact("q")];
        let p = ArtifactId(0);
        let q = ArtifactId(1);

        let mut jobs = IndexMap::new();
        let mut a = Job::new(false, BTreeSet::new());
        a.products.push(p);
        jobs.insert("pkg:a".to_string(), a);

        let mut b = Job::new(false, BTreeSet::new());
        b.deps.push(p);
        b.products.push(q);
        jobs.insert("pkg:b".to_string(), b);

        let mut c = Job::new(false, BTreeSet::new());
        c.deps.push(q);
        jobs.insert("pkg:c".to_string(), c);

        let mut d = Job::new(true, BTreeSet::new());
        d.deps.push(p);
        jobs.insert("pkg:d".to_string(), d);

        (jobs, artifacts)
    }

    #[test]
    fn test_fail_cascades_transitively() {
        let (mut jobs, mut artifacts) = chain();
        fail_job(&mut jobs, &mut artifacts, "pkg:a");

        assert_eq!(jobs["pkg:a"].status, JobStatus::Failed);
        assert_eq!(jobs["pkg:b"].status, JobStatus::Failed);
        assert_eq!(jobs["pkg:c"].status, JobStatus::Failed);
        // unstable consumer fails silently
        assert_eq!(jobs["pkg:d"].status, JobStatus::IgnoredFailure);

        for artifact in &artifacts {
            assert!(artifact.failed);
            assert!(artifact.received);
        }
        assert!(jobs.values().all(|job| job.status.terminating()));
    }

    #[test]
    fn test_fail_is_idempotent() {
        let (mut jobs, mut artifacts) = chain();
        fail_job(&mut jobs, &mut artifacts, "pkg:a");
        let statuses: Vec<_> = jobs.values().map(|j| j.status).collect();
        fail_job(&mut jobs, &mut artifacts, "pkg:a");
        assert_eq!(statuses, jobs.values().map(|j| j.status).collect::<Vec<_>>());
    }

    #[test]
    fn test_fail_running_job_awaits_completion() {
        let (mut jobs, mut artifacts) = chain();
        jobs["pkg:a"].status = JobStatus::Running;
        fail_job(&mut jobs, &mut artifacts, "pkg:a");
        assert_eq!(jobs["pkg:a"].status, JobStatus::WaitingForDone);
        assert_eq!(jobs["pkg:b"].status, JobStatus::Failed);
    }
}
