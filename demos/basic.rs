//! Minimal trellis example: typed routes, a prepare hook feeding an
//! injected argument, URL building and error handlers.
//!
//! Run with:
//!   RUST_LOG=debug cargo run --example basic
//!
//! Try:
//!   curl -i http://localhost:8080/users/42
//!   curl -i http://localhost:8080/static              # 308 to /static/
//!   curl -i http://localhost:8080/u/42                # alias, 308 to /users/42
//!   curl -i -X POST http://localhost:8080/users/ -d '{"name":"alice"}'
//!   curl -i -H 'x-tenant: acme' http://localhost:8080/whoami
//!   curl -i http://localhost:8080/static/css/site.css
//!   curl -i http://localhost:8080/nope

use std::sync::Arc;

use http::{Method, StatusCode};
use tracing_subscriber::EnvFilter;
use trellis::inject::{RequestComponent, RequestUrl};
use trellis::{
    Arguments, Capability, Error, NotFound, Request, Requirer, Response, Route, Router, Server,
};

struct Tenant(String);

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let requirer = Requirer::new().prerequisite(vec![Capability::of::<Tenant>()], vec![], load_tenant);

    let app = Router::new()
        .add(Route::at("/users/<int:id>").method(Method::GET).name("user"), get_user)
        .add(Route::at("/u/<int:id>").name("user").alias(), get_user)
        .on(Method::POST, "/users/", create_user)
        .route(
            "/whoami",
            requirer
                .require(whoami)
                .inject("tenant", RequestComponent::<Tenant>::new())
                .inject("url", RequestUrl),
        )
        .add(Route::at("/static/").branch(), serve_static)
        .handle_errors::<NotFound>(not_found);

    Server::bind("0.0.0.0:8080")
        .serve(app)
        .await
        .expect("server error");
}

async fn load_tenant(req: Request) -> Result<(), Error> {
    let Some(name) = req.header("x-tenant").map(str::to_owned) else {
        return Err(Error::early_exit(
            Response::builder().status(StatusCode::UNAUTHORIZED).text("missing x-tenant\n"),
        ));
    };
    req.set_component(Tenant(name));
    Ok(())
}

async fn get_user(_req: Request, args: Arguments) -> Result<Response, Error> {
    let id = args.get::<i64>("id")?;
    Ok(Response::json(format!(r#"{{"id":{id},"name":"alice"}}"#)))
}

async fn create_user(req: Request, _args: Arguments) -> Result<Response, Error> {
    if req.body().is_empty() {
        return Ok(Response::status(StatusCode::BAD_REQUEST));
    }
    let location = req.url_for("user").param("id", 99).external().build()?;
    Ok(Response::builder()
        .status(StatusCode::CREATED)
        .header("location", location)
        .json(r#"{"id":99,"name":"new_user"}"#))
}

async fn whoami(_req: Request, args: Arguments) -> Result<String, Error> {
    let tenant = args.get::<Arc<Tenant>>("tenant")?;
    let url = args.get::<url::Url>("url")?;
    Ok(format!("tenant {} asked for {url}\n", tenant.0))
}

async fn serve_static(req: Request, _args: Arguments) -> Result<String, Error> {
    Ok(format!("would serve {}\n", req.branch_segments().join("/")))
}

async fn not_found(req: Request, _err: Error) -> Result<Response, Error> {
    Ok(Response::builder()
        .status(StatusCode::NOT_FOUND)
        .text(format!("nothing at {}\n", req.path())))
}
