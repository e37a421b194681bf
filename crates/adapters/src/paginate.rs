use crate::IngestError;
use futures::stream::{self, Stream, TryStreamExt};
use std::future::Future;

/// Flatten a page-turning fetch into a stream of records. `turn` receives
/// the paging state and resolves to one page of records plus the state for
/// the next turn, or None when the listing is exhausted. Pages are fetched
/// lazily, one ahead of consumption, so a slow consumer paces the upstream.
pub fn pages<St, T, F, Fut>(initial: St, turn: F) -> impl Stream<Item = Result<T, IngestError>>
where
    St: Send + 'static,
    T: Send + 'static,
    F: FnMut(St) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<(Vec<T>, St)>, IngestError>> + Send + 'static,
{
    stream::try_unfold(Some(initial), wrap_turn(turn))
        .map_ok(|batch| stream::iter(batch.into_iter().map(Ok)))
        .try_flatten()
}

fn wrap_turn<St, T, F, Fut>(
    mut turn: F,
) -> impl FnMut(Option<St>) -> futures::future::BoxFuture<'static, Result<Option<(Vec<T>, Option<St>)>, IngestError>>
where
    St: Send + 'static,
    T: Send + 'static,
    F: FnMut(St) -> Fut + Send + 'static,
    Fut: Future<Output = Result<Option<(Vec<T>, St)>, IngestError>> + Send + 'static,
{
    move |state| {
        let fut = state.map(|state| turn(state));
        Box::pin(async move {
            match fut {
                None => Ok(None),
                Some(fut) => match fut.await? {
                    None => Ok(None),
                    Some((batch, next)) => Ok(Some((batch, Some(next)))),
                },
            }
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use futures::StreamExt;

    #[tokio::test]
    async fn pages_flatten_in_order_and_stop() {
        let stream = pages(0u32, |page| async move {
            if page == 3 {
                return Ok(None);
            }
            let batch: Vec<u32> = (page * 10..page * 10 + 2).collect();
            Ok(Some((batch, page + 1)))
        });

        let items: Vec<u32> = stream.map(|r| r.unwrap()).collect().await;
        assert_eq!(items, vec![0, 1, 10, 11, 20, 21]);
    }

    #[tokio::test]
    async fn page_errors_surface_once_and_end_the_stream() {
        let stream = pages(0u32, |page| async move {
            if page == 1 {
                return Err(IngestError::Schema {
                    url: "https://api.example.org/page/1".into(),
                    detail: "expected array".into(),
                });
            }
            Ok(Some((vec![page], page + 1)))
        });
        let mut stream = std::pin::pin!(stream);

        assert_eq!(stream.next().await.unwrap().unwrap(), 0);
        assert!(stream.next().await.unwrap().is_err());
    }
}
