use wd_cli::{Cli, Commands, Parser};

#[test]
fn parse_start_with_git_url() {
    let cli = Cli::try_parse_from([
        "wd",
        "start",
        "https://example.com/example.git",
        "--branch",
        "main",
    ])
    .unwrap();
    match cli.command {
        Commands::Start(args) => {
            assert_eq!(
                args.target.target.as_deref(),
                Some("https://example.com/example.git")
            );
            assert_eq!(args.target.branch, "main");
            assert!(!args.unforward);
        }
        _ => panic!("expected start"),
    }
}

#[test]
fn parse_start_remote_flags() {
    let cli = Cli::try_parse_from([
        "wd",
        "start",
        "https://example.com/example.git",
        "--host",
        "10.0.0.8",
        "--username",
        "dev",
        "--password",
        "pw",
        "--unforward",
        "--disable-clone",
    ])
    .unwrap();
    match cli.command {
        Commands::Start(args) => {
            assert_eq!(args.target.host.as_deref(), Some("10.0.0.8"));
            assert_eq!(args.target.port, 22);
            assert!(args.unforward);
            assert!(args.disable_clone);
        }
        _ => panic!("expected start"),
    }
}

#[test]
fn parse_start_pipeline_mode_with_callback() {
    let cli = Cli::try_parse_from([
        "wd",
        "start",
        "7",
        "--mode",
        "pipeline",
        "--callback-api-address",
        "https://api.example.com",
    ])
    .unwrap();
    match cli.command {
        Commands::Start(args) => {
            assert_eq!(args.target.workspace_id(), Some(7));
            assert_eq!(
                args.callback_api_address.as_deref(),
                Some("https://api.example.com")
            );
        }
        _ => panic!("expected start"),
    }
}

#[test]
fn parse_stop_by_id() {
    let cli = Cli::try_parse_from(["wd", "stop", "3"]).unwrap();
    match cli.command {
        Commands::Stop(args) => assert_eq!(args.workspace_id(), Some(3)),
        _ => panic!("expected stop"),
    }
}

#[test]
fn parse_remove_with_purge() {
    let cli = Cli::try_parse_from(["wd", "remove", "3", "--purge"]).unwrap();
    match cli.command {
        Commands::Remove(args) => {
            assert_eq!(args.target.workspace_id(), Some(3));
            assert!(args.purge);
        }
        _ => panic!("expected remove"),
    }
}

#[test]
fn parse_connect_requires_numeric_id() {
    let cli = Cli::try_parse_from(["wd", "connect", "12"]).unwrap();
    match cli.command {
        Commands::Connect(args) => assert_eq!(args.id, 12),
        _ => panic!("expected connect"),
    }
    assert!(Cli::try_parse_from(["wd", "connect", "not-a-number"]).is_err());
}

#[test]
fn parse_k8s_start() {
    let cli = Cli::try_parse_from([
        "wd",
        "start",
        "https://example.com/example.git",
        "--context",
        "kind-dev",
        "--kubeconfig",
        "~/.kube/config",
    ])
    .unwrap();
    match cli.command {
        Commands::Start(args) => {
            assert_eq!(args.target.context.as_deref(), Some("kind-dev"));
            assert!(args.target.namespace.is_none());
        }
        _ => panic!("expected start"),
    }
}

#[test]
fn parse_login() {
    let cli = Cli::try_parse_from([
        "wd",
        "login",
        "https://api.example.com",
        "-u",
        "dev",
        "-t",
        "token123",
    ])
    .unwrap();
    match cli.command {
        Commands::Login(args) => {
            assert_eq!(args.username, "dev");
            assert_eq!(args.token.as_deref(), Some("token123"));
        }
        _ => panic!("expected login"),
    }
}
