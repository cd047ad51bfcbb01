//! Demo entry point: registers and deletes students, then prints metrics.

use orchestration::OrchestrationConfig;
use school::{DeleteRequest, InMemoryStudentRegistry, Registration, SchoolService};
use tracing_subscriber::EnvFilter;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;

fn main() {
    // 1. Initialize tracing
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .with(tracing_subscriber::fmt::layer())
        .init();

    // 2. Install Prometheus metrics recorder
    let metrics_handle = metrics_exporter_prometheus::PrometheusBuilder::new()
        .install_recorder()
        .expect("failed to install Prometheus recorder");

    // 3. Build the service
    let config = OrchestrationConfig::from_env();
    tracing::info!(?config, "starting school demo");
    let registry = InMemoryStudentRegistry::new();
    let service = SchoolService::new(registry, &config).expect("failed to start worker pool");

    // 4. Register a few students
    let mut students = Vec::new();
    for (name, email, course) in [
        ("Ada Lovelace", "ada@school.test", "analysis"),
        ("Alan Turing", "alan@school.test", "computability"),
        ("Grace Hopper", "grace@school.test", "compilers"),
    ] {
        match service.register(Registration::new(name, email, course)) {
            Ok(student) => {
                tracing::info!(student = %student.id, %email, "registered");
                students.push(student);
            }
            Err(error) => tracing::error!(%error, %email, "registration failed"),
        }
    }

    // 5. A registration whose enrollment fails leaves no student behind
    service.registry().set_fail_on_enroll(true);
    let doomed = Registration::new("Edsger Dijkstra", "edsger@school.test", "semaphores");
    if let Err(error) = service.register(doomed) {
        tracing::warn!(%error, "registration rolled back");
    }
    service.registry().set_fail_on_enroll(false);
    tracing::info!(students = service.registry().student_count(), "after failed registration");

    // 6. Delete everyone at once, by id and by email
    let mut requests: Vec<DeleteRequest> = students
        .iter()
        .skip(1)
        .map(|student| DeleteRequest::by_id(student.id.clone()))
        .collect();
    requests.push(DeleteRequest::by_email("ada@school.test"));
    match service.delete_students(requests) {
        Ok(all_found) => tracing::info!(all_found, "students deleted"),
        Err(error) => tracing::error!(%error, "deletion failed"),
    }
    tracing::info!(
        students = service.registry().student_count(),
        transactions = service.transactions().finished().len(),
        "done"
    );

    // 7. Dump metrics
    println!("{}", metrics_handle.render());
}
