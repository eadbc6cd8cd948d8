use std::{sync::mpsc, time::Duration};

use anyhow::Context;
use gilmour::{
    logging, Backend, Envelope, EnvelopeCodec, JsonCodec, Listener, ReplyHandler, SendOptions,
    Settings,
};
use serde_json::json;

/// Эхо поверх хранилища в памяти: обработчик отвечает на `echo.*`,
/// отправляется один запрос и печатается ответ.
fn main() -> anyhow::Result<()> {
    let settings = Settings::load().context("loading settings")?;
    logging::init_logging(settings.logging.clone())?;

    let backend = Backend::in_memory(settings)?;
    let responder = backend.responder();
    backend.add_listener(
        "echo.*",
        Listener::new(move |topic, payload| {
            let request = JsonCodec.decode(&payload)?;
            tracing::info!(topic, sender = %request.sender, "Echo request");
            responder.respond(&request.sender, request.data, 200)?;
            Ok(())
        }),
    );

    let request_id = Backend::new_request_id();
    let payload = JsonCodec.encode(&Envelope::request(json!({"hello": "gilmour"}), &request_id))?;
    let (tx, rx) = mpsc::channel();
    let on_reply: ReplyHandler = Box::new(move |body, code| {
        tx.send((body, code))?;
        Ok(())
    });
    backend.send(
        &request_id,
        "echo.hello",
        payload,
        SendOptions::with_timeout(Duration::from_secs(5)),
        Some(on_reply),
    )?;

    let (body, code) = rx
        .recv_timeout(Duration::from_secs(10))
        .context("no reply received")?;
    println!("{code} {body}");

    backend.stop();
    Ok(())
}
