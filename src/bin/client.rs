use std::time::Instant;

use callguard::context::{AUTHORIZATION_HEADER, CORRELATION_ID_HEADER};
use callguard::proto::account_service_client::AccountServiceClient;
use callguard::proto::directory_service_client::DirectoryServiceClient;
use callguard::proto::{
    GetSessionRequest, ListRegionsRequest, PutRegionRequest, Region, RegisterRequest,
    SignInRequest, SignOutRequest, WhoAmIRequest,
};
use clap::{Parser, Subcommand};
use tonic::metadata::{Ascii, MetadataValue};
use tonic::transport::Channel;
use tonic::Request;
use tokio_stream::StreamExt;

#[derive(Parser)]
#[command(name = "client")]
#[command(about = "callguard command-line client", long_about = None)]
struct Cli {
    #[arg(short, long, default_value = "http://127.0.0.1:50051")]
    server: String,

    /// Bearer credential returned by `sign-in`
    #[arg(short, long, env = "CALLGUARD_TOKEN")]
    token: Option<String>,

    /// Correlation id to send instead of letting the server generate one
    #[arg(long)]
    correlation_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    Register {
        #[arg(short, long)]
        identifier: String,

        #[arg(short, long)]
        secret: String,

        #[arg(short, long, default_value = "")]
        display_name: String,

        #[arg(short, long)]
        email: String,
    },

    SignIn {
        #[arg(short, long)]
        identifier: String,

        #[arg(short, long)]
        secret: String,
    },

    Whoami,

    Session {
        #[arg(short = 'i', long)]
        session_id: String,
    },

    SignOut {
        #[arg(short = 'i', long)]
        session_id: String,
    },

    Regions,

    WatchRegions,

    PutRegion {
        #[arg(short, long)]
        code: String,

        #[arg(short, long)]
        name: String,
    },
}

/// Attaches the optional bearer credential and correlation id to every request.
struct CallOptions {
    token: Option<String>,
    correlation_id: Option<String>,
}

impl CallOptions {
    fn request<T>(&self, message: T) -> Result<Request<T>, Box<dyn std::error::Error>> {
        let mut request = Request::new(message);

        if let Some(token) = &self.token {
            let value: MetadataValue<Ascii> = format!("Bearer {token}").parse()?;
            request.metadata_mut().insert(AUTHORIZATION_HEADER, value);
        }

        if let Some(id) = &self.correlation_id {
            request
                .metadata_mut()
                .insert(CORRELATION_ID_HEADER, id.parse()?);
        }

        Ok(request)
    }
}

fn print_region(region: &Region) {
    println!("  {:<12} {}", region.code, region.name);
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    let channel = Channel::from_shared(cli.server.clone())?.connect().await?;
    let mut accounts = AccountServiceClient::new(channel.clone());
    let mut directory = DirectoryServiceClient::new(channel);

    let options = CallOptions {
        token: cli.token,
        correlation_id: cli.correlation_id,
    };

    match cli.command {
        Commands::Register {
            identifier,
            secret,
            display_name,
            email,
        } => {
            println!("Registering '{identifier}'...");

            let response = accounts
                .register(options.request(RegisterRequest {
                    identifier,
                    secret,
                    display_name,
                    email,
                })?)
                .await?
                .into_inner();

            println!("Success: user id {}", response.user_id);
        }

        Commands::SignIn { identifier, secret } => {
            let start = Instant::now();

            let response = accounts
                .sign_in(options.request(SignInRequest { identifier, secret })?)
                .await?
                .into_inner();

            println!("Signed in ({:?})", start.elapsed());
            println!("  Session id:   {}", response.session_id);
            println!("  Access token: {}", response.access_token);
            println!("  Expires at:   {}", response.token_expires_at);
        }

        Commands::Whoami => {
            let response = accounts
                .who_am_i(options.request(WhoAmIRequest {})?)
                .await?
                .into_inner();

            println!("Subject:        {}", response.subject_id);
            println!("Role:           {}", response.role);
            println!("Correlation id: {}", response.correlation_id);
        }

        Commands::Session { session_id } => {
            let session = accounts
                .get_session(options.request(GetSessionRequest { session_id })?)
                .await?
                .into_inner();

            println!("Session {}", session.session_id);
            println!("  User id:      {}", session.user_id);
            println!("  Display name: {}", session.display_name);
            println!("  Email:        {}", session.email);
            println!("  Issued at:    {}", session.issued_at);
            println!("  Expires at:   {}", session.expires_at);
        }

        Commands::SignOut { session_id } => {
            accounts
                .sign_out(options.request(SignOutRequest { session_id })?)
                .await?;
            println!("Signed out");
        }

        Commands::Regions => {
            let response = directory
                .list_regions(options.request(ListRegionsRequest {})?)
                .await?
                .into_inner();

            println!("{} regions:", response.regions.len());
            for region in &response.regions {
                print_region(region);
            }
        }

        Commands::WatchRegions => {
            let mut stream = directory
                .watch_regions(options.request(ListRegionsRequest {})?)
                .await?
                .into_inner();

            println!("Watching regions (Ctrl+C to stop)...");
            while let Some(region) = stream.next().await {
                print_region(&region?);
            }
        }

        Commands::PutRegion { code, name } => {
            let region = directory
                .put_region(options.request(PutRegionRequest { code, name })?)
                .await?
                .into_inner();

            println!("Stored region:");
            print_region(&region);
        }
    }

    Ok(())
}
