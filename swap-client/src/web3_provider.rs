use std::collections::VecDeque;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use swap_common::{Address, ProviderError, H256, U256};
use tokio::sync::broadcast;
use tracing::{debug, info};
use web3::{
    transports::Http,
    types::{BlockId, BlockNumber, Bytes, FilterBuilder, Log, TransactionRequest, U64},
    Transport, Web3,
};

use crate::provider::{
    BlockRange, CallRequest, ChainLog, ChainProvider, LogQuery, LogStream, ProviderResult, TxReceipt, TxRequest,
    WalletEvent,
};

/// JSON-RPC provider over HTTP.
///
/// Live subscriptions are emulated with polled log filters. HTTP cannot carry
/// wallet push notifications, so [`ChainProvider::wallet_events`] is
/// unsupported and the connection poll is the only change trigger.
pub struct Web3Provider {
    /// Web3 client
    client: Web3<Http>,

    /// Endpoint, for log lines
    rpc_url: String,

    /// Filter polling interval for live subscriptions
    live_poll_interval: Duration,

    /// Receipt polling interval while waiting for confirmations
    confirmation_poll_interval: Duration,
}

impl Web3Provider {
    pub fn new(rpc_url: &str, live_poll_interval: Duration, confirmation_poll_interval: Duration) -> ProviderResult<Self> {
        let transport = Http::new(rpc_url).map_err(map_web3_error)?;
        info!("Web3 provider created for {}", rpc_url);
        Ok(Self {
            client: Web3::new(transport),
            rpc_url: rpc_url.to_string(),
            live_poll_interval,
            confirmation_poll_interval,
        })
    }

    pub fn rpc_url(&self) -> &str {
        &self.rpc_url
    }
}

#[async_trait]
impl ChainProvider for Web3Provider {
    async fn request(&self, method: &str, params: Vec<Value>) -> ProviderResult<Value> {
        self.client
            .transport()
            .execute(method, params)
            .await
            .map_err(map_web3_error)
    }

    async fn accounts(&self) -> ProviderResult<Vec<Address>> {
        self.client.eth().accounts().await.map_err(map_web3_error)
    }

    async fn chain_id(&self) -> ProviderResult<U256> {
        self.client.eth().chain_id().await.map_err(map_web3_error)
    }

    async fn block_number(&self) -> ProviderResult<u64> {
        let number = self.client.eth().block_number().await.map_err(map_web3_error)?;
        Ok(number.as_u64())
    }

    async fn block_timestamp(&self, block_number: u64) -> ProviderResult<Option<u64>> {
        let block = self
            .client
            .eth()
            .block(BlockId::Number(BlockNumber::Number(U64::from(block_number))))
            .await
            .map_err(map_web3_error)?;
        Ok(block.map(|b| b.timestamp.low_u64()))
    }

    async fn logs(&self, query: LogQuery) -> ProviderResult<Vec<ChainLog>> {
        let logs = self
            .client
            .eth()
            .logs(build_filter(&query))
            .await
            .map_err(map_web3_error)?;
        Ok(logs.into_iter().map(chain_log).collect())
    }

    async fn subscribe_logs(&self, query: LogQuery) -> ProviderResult<LogStream> {
        let filter = self
            .client
            .eth_filter()
            .create_logs_filter(build_filter(&query))
            .await
            .map_err(map_web3_error)?;
        debug!("Installed log filter for topic {:?}", query.topic0);

        let interval = self.live_poll_interval;
        let stream = futures::stream::unfold((filter, VecDeque::new()), move |(filter, mut pending)| async move {
            loop {
                if let Some(log) = pending.pop_front() {
                    return Some((Ok(log), (filter, pending)));
                }
                tokio::time::sleep(interval).await;
                match filter.poll().await {
                    Ok(Some(logs)) => pending.extend(logs.into_iter().map(chain_log)),
                    Ok(None) => {}
                    Err(e) => return Some((Err(map_web3_error(e)), (filter, pending))),
                }
            }
        });
        Ok(Box::pin(stream))
    }

    async fn send_transaction(&self, tx: TxRequest) -> ProviderResult<H256> {
        let request = TransactionRequest {
            from: tx.from,
            to: Some(tx.to),
            gas: tx.gas,
            data: Some(Bytes(tx.data)),
            ..Default::default()
        };
        self.client
            .eth()
            .send_transaction(request)
            .await
            .map_err(map_web3_error)
    }

    async fn wait_for_confirmation(&self, tx_hash: H256, confirmations: usize) -> ProviderResult<TxReceipt> {
        let depth = confirmations.max(1) as u64 - 1;
        loop {
            let receipt = self
                .client
                .eth()
                .transaction_receipt(tx_hash)
                .await
                .map_err(map_web3_error)?;

            if let Some(receipt) = receipt {
                if let Some(mined_at) = receipt.block_number {
                    let head = self.block_number().await?;
                    if head >= mined_at.as_u64() + depth {
                        return Ok(TxReceipt {
                            tx_hash,
                            block_number: Some(mined_at.as_u64()),
                            success: receipt.status.map(|s| s.as_u64() == 1).unwrap_or(true),
                            logs: receipt.logs.into_iter().map(chain_log).collect(),
                        });
                    }
                }
            }
            tokio::time::sleep(self.confirmation_poll_interval).await;
        }
    }

    async fn call(&self, call: CallRequest, block: Option<u64>) -> ProviderResult<Vec<u8>> {
        let request = web3::types::CallRequest {
            from: call.from,
            to: Some(call.to),
            data: Some(Bytes(call.data)),
            ..Default::default()
        };
        let block = block.map(|n| BlockId::Number(BlockNumber::Number(U64::from(n))));
        let output = self
            .client
            .eth()
            .call(request, block)
            .await
            .map_err(map_web3_error)?;
        Ok(output.0)
    }

    fn wallet_events(&self) -> ProviderResult<broadcast::Receiver<WalletEvent>> {
        Err(ProviderError::Unsupported("wallet push notifications over HTTP".to_string()))
    }
}

fn build_filter(query: &LogQuery) -> web3::types::Filter {
    let builder = FilterBuilder::default()
        .address(vec![query.address])
        .topics(Some(vec![query.topic0]), None, None, None);
    match query.range {
        BlockRange::ProviderDefault => builder.build(),
        BlockRange::Bounded { from, to } => builder
            .from_block(BlockNumber::Number(U64::from(from)))
            .to_block(BlockNumber::Number(U64::from(to)))
            .build(),
    }
}

fn chain_log(log: Log) -> ChainLog {
    ChainLog {
        address: log.address,
        topics: log.topics,
        data: log.data.0,
        block_number: log.block_number.map(|n| n.as_u64()),
        transaction_hash: log.transaction_hash,
        log_index: log.log_index.map(|i| i.low_u64()),
        removed: log.removed.unwrap_or(false),
    }
}

/// Map web3 failures onto the provider taxonomy, keeping RPC codes and revert data
pub fn map_web3_error(err: web3::Error) -> ProviderError {
    match err {
        web3::Error::Rpc(rpc) => ProviderError::Rpc {
            code: rpc.code.code(),
            message: rpc.message,
            data: rpc.data.map(|data| match data {
                Value::String(text) => text,
                other => other.to_string(),
            }),
        },
        web3::Error::Decoder(message) | web3::Error::InvalidResponse(message) => ProviderError::Decode(message),
        other => ProviderError::Transport(other.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_creation() {
        let provider = Web3Provider::new("http://127.0.0.1:8545", Duration::from_secs(2), Duration::from_secs(1)).unwrap();
        assert_eq!(provider.rpc_url(), "http://127.0.0.1:8545");
        assert!(matches!(provider.wallet_events(), Err(ProviderError::Unsupported(_))));
    }

    #[test]
    fn test_chain_log_mapping() {
        let log = Log {
            address: Address::repeat_byte(0x55),
            topics: vec![H256::repeat_byte(1)],
            data: Bytes(vec![1, 2, 3]),
            block_hash: None,
            block_number: Some(U64::from(9)),
            transaction_hash: Some(H256::repeat_byte(2)),
            transaction_index: None,
            log_index: Some(U256::from(4)),
            transaction_log_index: None,
            log_type: None,
            removed: None,
        };
        let mapped = chain_log(log);
        assert_eq!(mapped.block_number, Some(9));
        assert_eq!(mapped.log_index, Some(4));
        assert_eq!(mapped.data, vec![1, 2, 3]);
        assert!(!mapped.removed);
    }

    #[test]
    fn test_bounded_filter() {
        let query = LogQuery {
            address: Address::repeat_byte(0x55),
            topic0: H256::repeat_byte(1),
            range: BlockRange::Bounded { from: 10, to: 20 },
        };
        let filter = build_filter(&query);
        let json = serde_json::to_value(&filter).unwrap();
        assert_eq!(json["fromBlock"], "0xa");
        assert_eq!(json["toBlock"], "0x14");
    }
}
