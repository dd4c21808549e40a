#![warn(clippy::unwrap_used)]

use std::future::Future;
use std::pin::Pin;

use hivesim::{run_suite, Client, Simulation, Suite, Test, TestSpec};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt::init();

    let mut smoke = Suite {
        name: "smoke".to_string(),
        description: "The smoke test suite launches every available client once and checks
        that it comes up, answers the node info endpoint and is reachable on a
        custom network."
            .to_string(),
        tests: vec![],
    };

    smoke.add(TestSpec {
        name: "client launch".to_string(),
        description: "This test launches every client and collects its logs.".to_string(),
        always_run: false,
        run: launch_clients,
        client: None,
    });

    let sim = Simulation::new();
    run_suite(sim, vec![smoke]).await;
}

fn launch_clients(
    test: &mut Test,
    _client: Option<Client>,
) -> Pin<Box<dyn Future<Output = ()> + Send + '_>> {
    Box::pin(async move {
        let network = "smoke-net";
        test.sim.create_network(test.suite_id, network).await;

        for definition in test.sim.client_types().await {
            let client = test.start_client(definition.name.clone(), None).await;
            assert!(!client.container.is_empty(), "client did not start");

            let info =
                test.sim.client_info(test.suite_id, test.test_id, &client.container).await;
            assert_eq!(info.id, client.container);

            test.sim.connect_container(test.suite_id, network, &client.container).await;
            let ip = test
                .sim
                .container_network_ip(test.suite_id, network, &client.container)
                .await;
            assert!(!ip.is_unspecified(), "client has no address on {network}");
            test.sim.disconnect_container(test.suite_id, network, &client.container).await;
        }

        test.sim.remove_network(test.suite_id, network).await;
    })
}
